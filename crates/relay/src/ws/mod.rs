// Real-time replication endpoint.
//
// Any path other than the REST routes addresses a document:
// `ws://host:port/<document-id>?secret=...`.

pub mod admission;
pub mod handler;

use std::sync::Arc;

use axum::{routing::get, Router};

use crate::store::CellStore;
use crate::sync::doc_manager::DocManager;

#[derive(Clone)]
pub struct SyncRouterState {
    pub store: CellStore,
    pub docs: Arc<DocManager>,
}

pub fn router(state: SyncRouterState) -> Router {
    Router::new()
        .route("/", get(handler::ws_upgrade_root))
        .route("/{*address}", get(handler::ws_upgrade))
        .with_state(state)
}
