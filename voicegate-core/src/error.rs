//! Service-wide error taxonomy.
//!
//! Every orchestrator operation returns either a result or one of these
//! typed errors; the admin surface maps them onto HTTP status codes.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of deadline elapsed. The admin surface reports a transfer
/// target that never answered (408) differently from a TTS server that
/// never produced audio (504).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A per-operation deadline against the switch or a socket.
    Operation,
    /// The transfer target did not answer in time.
    Transfer,
    /// The TTS server did not answer in time.
    Tts,
}

/// Classified failures for orchestrator operations and their collaborators.
#[derive(Error, Debug)]
pub enum Error {
    /// A call, bridge, recording, or endpoint does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Rejected by the allowlist.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The switch event link is down or the switch is unreachable.
    #[error("switch unavailable: {0}")]
    Unavailable(String),

    /// A deadline elapsed.
    #[error("timed out: {detail}")]
    Timeout { kind: TimeoutKind, detail: String },

    /// Bad input from a caller.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Malformed message from the switch or the ASR server.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The switch or the TTS server returned a failure.
    #[error("upstream failure ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// The operation needs a collaborator that is not configured.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Aborted by call lifecycle or process shutdown.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Error::Timeout {
            kind: TimeoutKind::Operation,
            detail: detail.into(),
        }
    }

    pub fn transfer_timeout(detail: impl Into<String>) -> Self {
        Error::Timeout {
            kind: TimeoutKind::Transfer,
            detail: detail.into(),
        }
    }

    pub fn tts_timeout(detail: impl Into<String>) -> Self {
        Error::Timeout {
            kind: TimeoutKind::Tts,
            detail: detail.into(),
        }
    }

    /// HTTP status the admin surface reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Forbidden(_) => 403,
            Error::Unavailable(_) => 503,
            // A TTS server that never answers is a bad gateway upstream;
            // everything else that times out is the request not completing.
            Error::Timeout { kind: TimeoutKind::Tts, .. } => 504,
            Error::Timeout { .. } => 408,
            Error::Validation(_) => 400,
            Error::Protocol(_) => 502,
            // Native switch status codes pass through when plausible.
            Error::Upstream { status, .. } if *status >= 400 => *status,
            Error::Upstream { .. } => 502,
            Error::NotImplemented(_) => 501,
            Error::Cancelled(_) => 409,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::timeout(e.to_string())
        } else if e.is_connect() {
            Error::Unavailable(e.to_string())
        } else {
            Error::Upstream {
                status: e.status().map(|s| s.as_u16()).unwrap_or(502),
                message: e.to_string(),
            }
        }
    }
}
