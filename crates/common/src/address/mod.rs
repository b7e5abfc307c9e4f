pub mod normalize;

pub use normalize::{normalize_document_address, AddressError, MAX_DOCUMENT_ID_CHARS};
