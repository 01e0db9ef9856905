//! Error handling for the event bus
//!
//! Unified error taxonomy shared by the dispatch engine, the dead-letter
//! queue and the metrics labels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;
use crate::kafka::TransportError;
use crate::outbox::OutboxError;

/// Application error types surfaced by the public API
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Event bus is shutting down")]
    ShuttingDown,

    #[error("Dead letter entry not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("Publish failed: {failed} of {matched} subscriptions terminated without success")]
    PublishFailed { matched: usize, failed: usize },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Terminal failure classification recorded on dead letters and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Timeout,
    ConsumerFailure,
    NonRetryable,
    Poison,
    CircuitRejected,
    RetryExhausted,
    QueueOverflow,
    TransportFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ConsumerFailure => "CONSUMER_FAILURE",
            ErrorKind::NonRetryable => "NON_RETRYABLE",
            ErrorKind::Poison => "POISON",
            ErrorKind::CircuitRejected => "CIRCUIT_REJECTED",
            ErrorKind::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorKind::QueueOverflow => "QUEUE_OVERFLOW",
            ErrorKind::TransportFailure => "TRANSPORT_FAILURE",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Well-known handler error classes
///
/// The class string drives retryability decisions and poison-signature
/// matching; handlers are free to use their own class names on top of these.
pub mod classes {
    pub const TIMEOUT: &str = "timeout";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const INVALID_STATE: &str = "invalid_state";
    pub const SERIALIZATION: &str = "serialization";
    pub const PARSE: &str = "parse";
    pub const FORMAT: &str = "format";
    pub const ENCODING: &str = "encoding";
    pub const CAST: &str = "cast";
    pub const NUMBER_FORMAT: &str = "number_format";
}

/// Error raised by an event handler
///
/// Carries a class name rather than a concrete type so that retry policies
/// and poison detection can classify failures from heterogeneous handlers.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{class}: {message}")]
pub struct HandlerError {
    pub class: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
        }
    }

    /// A failure that the default policy will retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("transient", message)
    }

    /// Attempt exceeded the subscription timeout
    pub fn timeout(limit: std::time::Duration) -> Self {
        Self::new(classes::TIMEOUT, format!("attempt exceeded {:?}", limit))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(classes::INVALID_ARGUMENT, message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(classes::INVALID_STATE, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(classes::SERIALIZATION, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.class == classes::TIMEOUT
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, EventBusError>;
