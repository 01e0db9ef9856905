//! Kafka bridge
//!
//! Fans local events out to external topics and consumes them back into
//! the local bus. The wire protocol lives behind an injected transport;
//! the rdkafka binding is the concrete default.

pub mod bridge;
pub mod consumer;
pub mod envelope;
pub mod transport;

pub use bridge::KafkaBridge;
pub use consumer::run_inbound;
pub use envelope::EventEnvelope;
pub use transport::{BridgeTransport, KafkaTransport, MemoryTransport, NoopTransport};

/// Errors raised by the bridge and its transports
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Max retries exceeded: {0}")]
    MaxRetriesExceeded(String),

    #[error("Local publish failed: {0}")]
    LocalPublish(String),
}
