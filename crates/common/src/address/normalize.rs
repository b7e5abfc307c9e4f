// Document address normalization for the real-time endpoint.
//
// A connection names its document through the request path. Exactly one
// leading and one trailing `/` are tolerated, so `/t1`, `t1/` and `/t1/`
// all address the document `t1`.

use thiserror::Error;

/// Maximum allowed document id length in characters.
pub const MAX_DOCUMENT_ID_CHARS: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("document address is empty")]
    Empty,

    #[error("document address exceeds maximum length of {MAX_DOCUMENT_ID_CHARS} characters")]
    TooLong,

    #[error("document address contains null byte")]
    NullByte,

    #[error("document address contains a nested segment: {0}")]
    Nested(String),
}

/// Turn a raw connection path into a document id.
///
/// Rules:
/// - Strip a single leading `/` and a single trailing `/`
/// - Reject null bytes
/// - Reject empty ids and whitespace-only ids
/// - Reject ids that still contain `/` (only one path segment names a document)
/// - Enforce the max id length
pub fn normalize_document_address(input: &str) -> Result<String, AddressError> {
    if input.contains('\0') {
        return Err(AddressError::NullByte);
    }

    let trimmed = input.strip_prefix('/').unwrap_or(input);
    let trimmed = trimmed.strip_suffix('/').unwrap_or(trimmed);

    if trimmed.trim().is_empty() {
        return Err(AddressError::Empty);
    }

    if trimmed.contains('/') {
        return Err(AddressError::Nested(trimmed.to_string()));
    }

    if trimmed.chars().count() > MAX_DOCUMENT_ID_CHARS {
        return Err(AddressError::TooLong);
    }

    Ok(trimmed.to_string())
}
