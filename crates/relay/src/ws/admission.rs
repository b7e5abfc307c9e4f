// Admission gate for replication connections.
//
// A connection names a document by address and may carry a secret. It is
// admitted only when the document exists and the secret matches what the
// document requires; everything else is rejected with a close reason.

use gridsync_common::address::normalize_document_address;
use gridsync_common::protocol::close::CloseReason;
use gridsync_common::types::Document;
use tracing::debug;

use crate::store::CellStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    InvalidSecret,
    Internal,
}

impl RejectReason {
    pub fn close_reason(self) -> CloseReason {
        match self {
            Self::NotFound => CloseReason::DocumentNotFound,
            Self::InvalidSecret => CloseReason::InvalidSecret,
            Self::Internal => CloseReason::InternalError,
        }
    }
}

#[derive(Debug)]
pub enum Rejection {
    NotFound { address: String },

    InvalidSecret { doc_id: String },

    Internal { address: String, source: anyhow::Error },
}

impl Rejection {
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::NotFound { .. } => RejectReason::NotFound,
            Self::InvalidSecret { .. } => RejectReason::InvalidSecret,
            Self::Internal { .. } => RejectReason::Internal,
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { address } => write!(f, "no document at address `{address}`"),
            Self::InvalidSecret { doc_id } => {
                write!(f, "secret mismatch for document {doc_id}")
            }
            Self::Internal { address, source } => {
                write!(f, "failed to resolve document at address `{address}`: {source:#}")
            }
        }
    }
}

impl std::error::Error for Rejection {}

/// An admitted connection, bound to one document.
#[derive(Debug, Clone)]
pub struct Admission {
    pub doc_id: String,
    pub document: Document,
}

/// Resolve `address` to a document and check `supplied_secret` against it.
pub async fn admit(
    store: &CellStore,
    address: &str,
    supplied_secret: Option<&str>,
) -> Result<Admission, Rejection> {
    let doc_id = match normalize_document_address(address) {
        Ok(doc_id) => doc_id,
        Err(error) => {
            debug!(address, error = %error, "unresolvable document address");
            return Err(Rejection::NotFound { address: address.to_string() });
        }
    };

    let document = store
        .find_document(&doc_id)
        .await
        .map_err(|source| Rejection::Internal { address: address.to_string(), source })?
        .ok_or_else(|| Rejection::NotFound { address: address.to_string() })?;

    if !secret_matches(&document, supplied_secret) {
        return Err(Rejection::InvalidSecret { doc_id });
    }

    Ok(Admission { doc_id, document })
}

/// Unprotected documents admit anyone. Protected ones need an exact match; a
/// missing or empty secret never matches.
pub fn secret_matches(document: &Document, supplied: Option<&str>) -> bool {
    match document.required_secret() {
        None => true,
        Some(required) => supplied.is_some_and(|supplied| supplied == required),
    }
}

/// Lifecycle of one replication connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Resolving,
    Rejected(RejectReason),
    Accepted,
    Attached,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ConnectionPhase,
    pub to: ConnectionPhase,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid connection transition {:?} -> {:?}", self.from, self.to)
    }
}

impl std::error::Error for InvalidTransition {}

impl ConnectionPhase {
    pub fn can_advance_to(&self, next: &ConnectionPhase) -> bool {
        use ConnectionPhase::*;

        matches!(
            (self, next),
            (Connecting, Resolving)
                | (Resolving, Rejected(_))
                | (Resolving, Accepted)
                | (Accepted, Attached)
                | (Accepted, Closed)
                | (Attached, Closed)
        )
    }

    pub fn advance(self, next: ConnectionPhase) -> Result<ConnectionPhase, InvalidTransition> {
        if self.can_advance_to(&next) {
            Ok(next)
        } else {
            Err(InvalidTransition { from: self, to: next })
        }
    }

    /// `Rejected` and `Closed` accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Closed)
    }
}
