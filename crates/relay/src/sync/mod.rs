pub mod doc_manager;
pub mod grid;
pub mod hydrate;
pub mod session;
pub mod snapshot;
