use std::time::Duration;
use thiserror::Error;

/// Errors at the transport boundary. All of these are recoverable from the
/// supervisor's point of view: the session is torn down and rebuilt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{op} did not complete within {deadline:?}")]
    Timeout { op: &'static str, deadline: Duration },

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("failed to send frame: {0}")]
    Send(String),

    #[error("failed to encode frame: {0}")]
    Encode(String),

    #[error("connection closed")]
    Closed,

    #[error("session is not open")]
    NotOpen,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Errors surfaced to the caller of the session manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid endpoint {url}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("retry budget exhausted after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}
