//! In-process typed event bus
//!
//! Delivers events from publishers to subscribers with per-subscription
//! retry, circuit breaking, dead-letter routing, poison-message detection,
//! an at-least-once outbox, and a Kafka bridge. Collaborators (metrics,
//! trace export, outbox storage, Kafka transport) are injected.

pub mod circuit_breaker;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod event;
pub mod kafka;
pub mod metrics;
pub mod outbox;
pub mod poison;
pub mod retry;
pub mod subscription;
pub mod trace;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use config::{BusConfig, ConfigError, KafkaBridgeConfig, OutboxConfig};
pub use dispatch::{DeliveryOutcome, EventBus, EventBusBuilder, PublishHandle, PublishSummary};
pub use dlq::{DeadLetterEvent, DeadLetterQueue, DeadLetterStatus};
pub use error::{ErrorKind, EventBusError, HandlerError, Result};
pub use event::{Event, EventPriority};
pub use kafka::{EventEnvelope, KafkaBridge, KafkaTransport, NoopTransport, TransportError};
pub use metrics::{MetricsSink, MetricsSnapshot, NoopMetrics, PrometheusMetrics};
pub use outbox::{
    InMemoryOutboxStore, LocalPublishTarget, OutboxEntry, OutboxError, OutboxPublisher,
    OutboxStatus, OutboxStore, PublishTarget,
};
pub use poison::{PoisonAction, PoisonMessageHandler, PoisonPolicy, PoisonStats};
pub use retry::RetryPolicy;
pub use subscription::{
    StatsSnapshot, Subscription, SubscriptionInfo, SubscriptionOptions, SubscriptionRegistry,
};
pub use trace::{NoopExporter, SpanExporter, SpanRecord, TraceContext, TracingExporter};
