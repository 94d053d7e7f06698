use thiserror::Error;

use crate::handler::HandlerError;
use crate::notice::ConnectionStatus;

// Worker error types
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Not connected to a broker")]
    NotConnected,

    #[error("Already connected to a broker")]
    AlreadyConnected,

    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("Subscribe error: {0}")]
    SubscribeError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    #[error("Handler error: {0}")]
    HandlerError(#[from] HandlerError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Cannot announce {to} after {from:?}")]
    InvalidTransition {
        from: Option<ConnectionStatus>,
        to: ConnectionStatus,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl WorkerError {
    /// Whether the failure is confined to a single inbound message.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            WorkerError::MalformedRequest(_) | WorkerError::HandlerError(_)
        )
    }
}
