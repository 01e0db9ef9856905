//! Bridge transports
//!
//! The bridge publishes through this interface so the core never speaks
//! the Kafka wire protocol itself. `NoopTransport` is the default binding;
//! `KafkaTransport` is the rdkafka-backed one.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;

use crate::config::KafkaBridgeConfig;
use crate::kafka::TransportError;

/// Outbound publication contract for the bridge
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError>;
}

/// Transport that drops outbound messages; the default when no broker is
/// wired in.
#[derive(Debug, Clone, Default)]
pub struct NoopTransport;

#[async_trait]
impl BridgeTransport for NoopTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        tracing::debug!(
            topic = topic,
            key = key,
            bytes = payload.len(),
            "Dropping outbound event (noop transport)"
        );
        Ok(())
    }
}

/// Transport that records outbound messages in memory, for tests and
/// local development without a broker.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(String, String, Vec<u8>)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String, Vec<u8>)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl BridgeTransport for MemoryTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((topic.to_string(), key.to_string(), payload.to_vec()));
        }
        Ok(())
    }
}

/// Kafka producer transport
///
/// Publishes with:
/// - Idempotent producer semantics (acks=all, enable.idempotence)
/// - Automatic retry with exponential backoff
/// - Zstandard compression
pub struct KafkaTransport {
    producer: FutureProducer,
    config: KafkaBridgeConfig,
}

impl KafkaTransport {
    pub fn new(config: KafkaBridgeConfig) -> Result<Self, TransportError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", &config.client_id)
            .set("compression.type", "zstd")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set(
                "request.timeout.ms",
                config.request_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| TransportError::Kafka(e.to_string()))?;

        tracing::info!(
            bootstrap_servers = config.bootstrap_servers.as_str(),
            "Kafka transport created"
        );

        Ok(Self { producer, config })
    }
}

#[async_trait]
impl BridgeTransport for KafkaTransport {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut last_error = None;

        for attempt in 0..=self.config.send_retries {
            let record = FutureRecord::to(topic).key(key).payload(payload);

            match self
                .producer
                .send(record, Timeout::After(self.config.request_timeout))
                .await
            {
                Ok(_) => return Ok(()),
                Err((e, _)) => {
                    last_error = Some(e.to_string());

                    if attempt < self.config.send_retries {
                        let backoff = Duration::from_millis(
                            self.config.retry_backoff.as_millis() as u64 * 2u64.pow(attempt),
                        );
                        tracing::warn!(
                            topic = topic,
                            attempt = attempt + 1,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Kafka send failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        tracing::error!(topic = topic, "Max retries exceeded for Kafka send");
        Err(TransportError::MaxRetriesExceeded(
            last_error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_records_sends() {
        let transport = MemoryTransport::new();
        transport.send("events.t", "k1", b"payload").await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "events.t");
        assert_eq!(sent[0].1, "k1");
    }

    #[tokio::test]
    async fn noop_transport_accepts_everything() {
        let transport = NoopTransport;
        assert!(transport.send("t", "k", b"x").await.is_ok());
    }
}
