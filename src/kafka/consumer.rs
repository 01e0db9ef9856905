//! Inbound consumer loop
//!
//! A consumer-group loop that reads configured topics, hands each message
//! to the bridge for local dispatch, and commits the offset only after the
//! local publish completed.

use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tokio::sync::watch;

use crate::config::KafkaBridgeConfig;
use crate::dispatch::EventBus;
use crate::kafka::bridge::KafkaBridge;
use crate::kafka::TransportError;

fn create_consumer(config: &KafkaBridgeConfig) -> Result<StreamConsumer, TransportError> {
    ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.group_id)
        .set("client.id", &config.client_id)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", "30000")
        .create()
        .map_err(|e| TransportError::Kafka(e.to_string()))
}

/// Run the inbound loop until the shutdown signal flips
pub async fn run_inbound(
    config: &KafkaBridgeConfig,
    topics: &[&str],
    bridge: Arc<KafkaBridge>,
    bus: EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let consumer = create_consumer(config)?;
    consumer
        .subscribe(topics)
        .map_err(|e| TransportError::Kafka(e.to_string()))?;

    tracing::info!(
        group_id = config.group_id.as_str(),
        topics = ?topics,
        "Inbound consumer started"
    );

    loop {
        tokio::select! {
            result = consumer.recv() => {
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::error!(error = %e, "Inbound consumer receive failed");
                        continue;
                    }
                };

                let Some(payload) = message.payload() else {
                    tracing::warn!(
                        topic = message.topic(),
                        offset = message.offset(),
                        "Skipping message with empty payload"
                    );
                    continue;
                };

                if let Err(e) = bridge.handle_inbound(payload, &bus).await {
                    tracing::error!(
                        topic = message.topic(),
                        offset = message.offset(),
                        error = %e,
                        "Inbound event dispatch failed"
                    );
                }

                // Commit regardless: failed deliveries are already captured
                // by the local DLQ, replaying the offset would double them.
                if let Err(e) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(error = %e, "Offset commit failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Inbound consumer stopping");
                    break;
                }
            }
        }
    }

    Ok(())
}
