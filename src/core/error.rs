//! Typed errors for the server-side coordination core.
//!
//! Every failure the relay, fan-out or store can raise lands in one of these
//! buckets. None of them is process-fatal; the HTTP and WebSocket surfaces
//! turn them into a status code or an `error` envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Caller is not a participant of the session (or not allowed to act on it).
    #[error("not authorized: {0}")]
    Authorization(String),

    /// Malformed or missing fields. No state was mutated.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown session or request.
    #[error("not found: {0}")]
    NotFound(String),

    /// No fresh stations, or the relay target is not connected.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Socket I/O or station-side production failure.
    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    /// A signaling or transfer deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl RelayError {
    /// HTTP status code the API surface reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::Authorization(_) => 403,
            RelayError::Validation(_) => 400,
            RelayError::NotFound(_) => 404,
            RelayError::Unavailable(_) => 503,
            RelayError::Timeout(_) => 504,
            RelayError::TransientIo(_) | RelayError::Storage(_) => 500,
        }
    }

    /// The bare message without the variant prefix, as sent to API clients.
    pub fn message(&self) -> String {
        match self {
            RelayError::Authorization(m)
            | RelayError::Validation(m)
            | RelayError::NotFound(m)
            | RelayError::Unavailable(m)
            | RelayError::TransientIo(m)
            | RelayError::Timeout(m) => m.clone(),
            RelayError::Storage(_) => "storage failure".to_string(),
        }
    }

    /// Whether the caller (rather than the server) is at fault.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.status_code())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_map_to_4xx() {
        assert_eq!(RelayError::Authorization("x".into()).status_code(), 403);
        assert_eq!(RelayError::Validation("x".into()).status_code(), 400);
        assert!(RelayError::NotFound("x".into()).is_client_error());
        assert!(!RelayError::Unavailable("x".into()).is_client_error());
    }

    #[test]
    fn unavailable_message_is_preserved() {
        let err = RelayError::Unavailable("no collectors available".into());
        assert_eq!(err.to_string(), "unavailable: no collectors available");
        assert_eq!(err.message(), "no collectors available");
    }

    #[test]
    fn upstream_failures_map_to_5xx() {
        assert_eq!(RelayError::TransientIo("x".into()).status_code(), 500);
        assert_eq!(RelayError::Timeout("x".into()).status_code(), 504);
        let storage = RelayError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(storage.message(), "storage failure");
    }
}
