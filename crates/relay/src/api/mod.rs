// REST surface for document metadata and cells.

pub mod documents;

use axum::Router;

pub use documents::DocApiState;

pub fn router(state: DocApiState) -> Router {
    documents::router(state)
}
