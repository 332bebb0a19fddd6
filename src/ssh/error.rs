//! SSH Session error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Operation attempted out of the required lifecycle order
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Connection timed out: {0}")]
    ConnectionTimeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Authentication rejected: {0}")]
    AuthenticationRejected(String),

    #[error("Key file unreadable: {0}")]
    KeyFileUnreadable(String),

    #[error("Key decryption failed: {0}")]
    KeyDecryptionFailed(String),

    #[error("No keyboard-interactive handler registered")]
    NoInteractiveHandler,

    #[error("Another authentication is already in progress")]
    OperationInProgress,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session closed")]
    SessionClosed,

    #[error("Trust file unreadable: {0}")]
    TrustFileUnreadable(String),

    #[error("SSH Agent not available: {0}")]
    AgentUnavailable(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<russh::Error> for SessionError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => SessionError::SessionClosed,
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Config(err.to_string())
    }
}

// Serialized as its display string, same as the error crossing an IPC boundary
impl serde::Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
