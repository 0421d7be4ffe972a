use thiserror::Error;

use crate::resilience::AttemptTimeout;

/// Error surfaced by every remote backend operation.
///
/// The retry wrapper treats all variants the same way: each one fails the
/// current attempt, and the last one seen is returned unchanged once attempts
/// are exhausted.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Timeout(#[from] AttemptTimeout),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No authenticated session")]
    NotAuthenticated,
}

impl BackendError {
    /// HTTP status of an `Api` error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            BackendError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BackendError::Timeout(_))
    }
}
