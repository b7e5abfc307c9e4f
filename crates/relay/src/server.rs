// Router assembly, shared middleware, and store selection.

use std::{sync::Arc, time::Duration, time::Instant};

use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tracing::{error, info, warn};

use crate::api::{self, DocApiState};
use crate::db::migrations::run_migrations;
use crate::config::DatabaseConfig;
use crate::db::pool;
use crate::error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope};
use crate::store::CellStore;
use crate::sync::doc_manager::DocManager;
use crate::ws::{self, SyncRouterState};

pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Everything a running relay shares between its routes.
#[derive(Clone)]
pub struct AppState {
    pub store: CellStore,
    pub docs: Arc<DocManager>,
}

impl AppState {
    pub fn new(store: CellStore, flush_quiet_period: Duration) -> Self {
        let docs = Arc::new(DocManager::new(store.clone(), flush_quiet_period));
        Self { store, docs }
    }
}

/// Connect to PostgreSQL and migrate when a database is configured; otherwise
/// fall back to the in-memory store.
pub async fn connect_store(database: Option<&DatabaseConfig>) -> Result<CellStore> {
    let Some(database) = database else {
        warn!("no database configured; documents will not survive a restart");
        return Ok(CellStore::memory());
    };

    let pool =
        pool::connect(database).await.context("failed to initialize relay PostgreSQL pool")?;
    run_migrations(&pool).await?;
    info!("connected to relay PostgreSQL");

    Ok(CellStore::Postgres(pool))
}

pub fn build_router(state: AppState) -> Router {
    let api_state = DocApiState { store: state.store.clone(), docs: Arc::clone(&state.docs) };
    let sync_state = SyncRouterState { store: state.store, docs: state.docs };

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(api::router(api_state))
            .merge(ws::router(sync_state)),
    )
}

pub fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
