// Document metadata and cell endpoints.
//
// Routes:
//   GET    /api/documents                          list
//   POST   /api/documents                          create
//   GET    /api/documents/{doc_id}                 get single
//   DELETE /api/documents/{doc_id}                 delete with cells
//   GET    /api/documents/{doc_id}/cells           durable cells
//   PUT    /api/documents/{doc_id}/cells/{row}/{col}  set one cell
//
// Cell routes take the same `?secret=` as the real-time endpoint.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use gridsync_common::types::{Cell, Document, DocumentSummary, NewDocument};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ErrorCode, RelayError};
use crate::store::CellStore;
use crate::sync::doc_manager::DocManager;
use crate::ws::admission::secret_matches;

/// Largest row or column count a document may be created with.
pub const MAX_GRID_DIMENSION: i32 = 1_000;
/// Largest row or column index a single cell write may address.
pub const MAX_CELL_INDEX: i32 = MAX_GRID_DIMENSION - 1;
const MAX_DOCUMENT_NAME_CHARS: usize = 200;

// ── Request / Response types ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetCellRequest {
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CellAccess {
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Serialize)]
struct DocumentEnvelope {
    document: DocumentSummary,
}

#[derive(Serialize)]
struct DocumentsEnvelope {
    items: Vec<DocumentSummary>,
}

#[derive(Serialize)]
struct CellsEnvelope {
    items: Vec<Cell>,
}

// ── State & errors ─────────────────────────────────────────────────

#[derive(Clone)]
pub struct DocApiState {
    pub store: CellStore,
    pub docs: Arc<DocManager>,
}

#[derive(Debug)]
enum DocApiError {
    BadRequest { message: String, field: &'static str },
    Forbidden,
    NotFound,
    Internal(anyhow::Error),
}

impl DocApiError {
    fn bad_request(field: &'static str, message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into(), field }
    }
}

impl From<anyhow::Error> for DocApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl IntoResponse for DocApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message, field } => {
                RelayError::new(ErrorCode::ValidationFailed, message)
                    .with_details(json!({ "field": field }))
                    .into_response()
            }
            Self::Forbidden => RelayError::from_code(ErrorCode::Forbidden).into_response(),
            Self::NotFound => {
                RelayError::new(ErrorCode::NotFound, "document not found").into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = ?error, "document api internal error");
                RelayError::from_code(ErrorCode::InternalError).into_response()
            }
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(state: DocApiState) -> Router {
    Router::new()
        .route("/api/documents", get(list_documents).post(create_document))
        .route("/api/documents/{doc_id}", get(get_document).delete(delete_document))
        .route("/api/documents/{doc_id}/cells", get(list_cells))
        .route("/api/documents/{doc_id}/cells/{row}/{col}", put(set_cell))
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────

async fn list_documents(
    State(state): State<DocApiState>,
) -> Result<Json<DocumentsEnvelope>, DocApiError> {
    let items = state.store.list_documents().await?.iter().map(|doc| doc.summary()).collect();
    Ok(Json(DocumentsEnvelope { items }))
}

async fn create_document(
    State(state): State<DocApiState>,
    Json(payload): Json<NewDocument>,
) -> Result<(StatusCode, Json<DocumentEnvelope>), DocApiError> {
    validate_new_document(&payload)?;

    let document = state.store.create_document(&payload).await?;
    tracing::info!(doc_id = %document.id, "document created");

    Ok((StatusCode::CREATED, Json(DocumentEnvelope { document: document.summary() })))
}

async fn get_document(
    State(state): State<DocApiState>,
    Path(doc_id): Path<String>,
) -> Result<Json<DocumentEnvelope>, DocApiError> {
    let document = state.store.find_document(&doc_id).await?.ok_or(DocApiError::NotFound)?;
    Ok(Json(DocumentEnvelope { document: document.summary() }))
}

async fn delete_document(
    State(state): State<DocApiState>,
    Path(doc_id): Path<String>,
) -> Result<StatusCode, DocApiError> {
    if !state.store.delete_document(&doc_id).await? {
        return Err(DocApiError::NotFound);
    }
    if state.docs.session(&doc_id).await.is_some() {
        tracing::warn!(doc_id = %doc_id, "deleted a document that still has live peers");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_cells(
    State(state): State<DocApiState>,
    Path(doc_id): Path<String>,
    Query(access): Query<CellAccess>,
) -> Result<Json<CellsEnvelope>, DocApiError> {
    authorize(&state, &doc_id, &access).await?;
    let items = state.store.list_cells(&doc_id).await?;
    Ok(Json(CellsEnvelope { items }))
}

/// Lands in the live grid when the document is open so peers see the change
/// and the regular flush persists it; otherwise lands in the store.
async fn set_cell(
    State(state): State<DocApiState>,
    Path((doc_id, row, col)): Path<(String, i32, i32)>,
    Query(access): Query<CellAccess>,
    Json(payload): Json<SetCellRequest>,
) -> Result<StatusCode, DocApiError> {
    let (row_index, col_index) = validate_cell_position(row, col)?;
    authorize(&state, &doc_id, &access).await?;

    state.docs.write_cell(&doc_id, row_index, col_index, &payload.value).await?;

    Ok(StatusCode::NO_CONTENT)
}

async fn authorize(
    state: &DocApiState,
    doc_id: &str,
    access: &CellAccess,
) -> Result<Document, DocApiError> {
    let document = state.store.find_document(doc_id).await?.ok_or(DocApiError::NotFound)?;
    if !secret_matches(&document, access.secret.as_deref()) {
        return Err(DocApiError::Forbidden);
    }
    Ok(document)
}

// ── Validation ─────────────────────────────────────────────────────

fn validate_new_document(payload: &NewDocument) -> Result<(), DocApiError> {
    if let Some(name) = payload.name.as_deref() {
        if name.chars().count() > MAX_DOCUMENT_NAME_CHARS {
            return Err(DocApiError::bad_request(
                "name",
                format!("name exceeds {MAX_DOCUMENT_NAME_CHARS} characters"),
            ));
        }
    }
    for (field, value) in [("rows", payload.rows), ("cols", payload.cols)] {
        if value.is_some_and(|value| value > MAX_GRID_DIMENSION) {
            return Err(DocApiError::bad_request(
                field,
                format!("{field} must be at most {MAX_GRID_DIMENSION}"),
            ));
        }
    }
    Ok(())
}

fn validate_cell_position(row: i32, col: i32) -> Result<(u32, u32), DocApiError> {
    let in_range = |index: i32| (0..=MAX_CELL_INDEX).contains(&index);
    for (field, index) in [("row", row), ("col", col)] {
        if !in_range(index) {
            return Err(DocApiError::bad_request(
                field,
                format!("{field} must be within 0..={MAX_CELL_INDEX}"),
            ));
        }
    }
    Ok((row.unsigned_abs(), col.unsigned_abs()))
}
