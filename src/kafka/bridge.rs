//! Bridge between the local bus and external topics

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::EventBus;
use crate::event::Event;
use crate::kafka::envelope::{derived_topic, EventEnvelope};
use crate::kafka::transport::BridgeTransport;
use crate::kafka::TransportError;
use crate::outbox::PublishTarget;

pub struct KafkaBridge {
    transport: Arc<dyn BridgeTransport>,
    topic_prefix: String,
    topic_overrides: HashMap<String, String>,
}

impl KafkaBridge {
    pub fn new(transport: Arc<dyn BridgeTransport>, topic_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            topic_prefix: topic_prefix.into(),
            topic_overrides: HashMap::new(),
        }
    }

    /// Map one event type to an explicit topic instead of the derived name
    pub fn with_topic_override(
        mut self,
        event_type: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        self.topic_overrides.insert(event_type.into(), topic.into());
        self
    }

    pub fn topic_for(&self, event_type: &str) -> String {
        self.topic_overrides
            .get(event_type)
            .cloned()
            .unwrap_or_else(|| derived_topic(&self.topic_prefix, event_type))
    }

    /// Serialize an event and send it out, keyed by event id
    pub async fn forward(&self, event: &Event) -> Result<(), TransportError> {
        let topic = self.topic_for(&event.event_type);
        let envelope = EventEnvelope::from(event.clone());
        let payload = serde_json::to_vec(&envelope)?;

        self.transport
            .send(&topic, &event.id.to_string(), &payload)
            .await?;
        tracing::debug!(
            event_id = %event.id,
            topic = topic.as_str(),
            "Event forwarded to bridge"
        );
        Ok(())
    }

    /// Deserialize an inbound message and publish it on the local dispatch
    /// path only; inbound events are not forwarded back out.
    pub async fn handle_inbound(
        &self,
        payload: &[u8],
        bus: &EventBus,
    ) -> Result<(), TransportError> {
        let envelope: EventEnvelope = serde_json::from_slice(payload)?;
        let event = envelope.into_event();
        tracing::debug!(
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            "Inbound event from bridge"
        );

        let handle = bus
            .publish(event)
            .map_err(|e| TransportError::LocalPublish(e.to_string()))?;
        handle
            .await_completion()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::LocalPublish(e.to_string()))
    }
}

#[async_trait]
impl PublishTarget for KafkaBridge {
    async fn deliver(&self, event: Event) -> Result<(), TransportError> {
        self.forward(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::transport::MemoryTransport;

    #[test]
    fn override_wins_over_derived_topic() {
        let bridge = KafkaBridge::new(Arc::new(MemoryTransport::new()), "events")
            .with_topic_override("ORDER_CREATED", "orders.v2");

        assert_eq!(bridge.topic_for("ORDER_CREATED"), "orders.v2");
        assert_eq!(bridge.topic_for("USER_SIGNED_UP"), "events.user-signed-up");
    }

    #[tokio::test]
    async fn forward_sends_envelope_keyed_by_event_id() {
        let transport = Arc::new(MemoryTransport::new());
        let bridge = KafkaBridge::new(transport.clone(), "events");
        let event = Event::new("ORDER_CREATED", serde_json::json!({"orderId": "o-1"}))
            .with_source("orders");

        bridge.forward(&event).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "events.order-created");
        assert_eq!(sent[0].1, event.id.to_string());

        let envelope: EventEnvelope = serde_json::from_slice(&sent[0].2).unwrap();
        assert_eq!(envelope.event_id, event.id);
    }
}
