// WebSocket close codes used by the real-time endpoint.
//
// Admission rejections use the application range (4000-4999) so a client can
// tell "no such document" from "wrong secret"; unexpected failures use the
// standard internal-error code.

/// Client- or server-initiated orderly shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// The addressed document does not exist.
pub const CLOSE_DOCUMENT_NOT_FOUND: u16 = 4404;
/// The document is protected and the supplied secret did not match.
pub const CLOSE_INVALID_SECRET: u16 = 4403;
/// The server hit an unexpected error while setting up the connection.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why a connection was closed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Normal,
    DocumentNotFound,
    InvalidSecret,
    InternalError,
}

impl CloseReason {
    pub const fn code(self) -> u16 {
        match self {
            Self::Normal => CLOSE_NORMAL,
            Self::DocumentNotFound => CLOSE_DOCUMENT_NOT_FOUND,
            Self::InvalidSecret => CLOSE_INVALID_SECRET,
            Self::InternalError => CLOSE_INTERNAL_ERROR,
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::Normal => "normal closure",
            Self::DocumentNotFound => "document not found",
            Self::InvalidSecret => "invalid secret",
            Self::InternalError => "internal error",
        }
    }

    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            CLOSE_NORMAL => Some(Self::Normal),
            CLOSE_DOCUMENT_NOT_FOUND => Some(Self::DocumentNotFound),
            CLOSE_INVALID_SECRET => Some(Self::InvalidSecret),
            CLOSE_INTERNAL_ERROR => Some(Self::InternalError),
            _ => None,
        }
    }
}
