//! Event envelope
//!
//! JSON wire form of an event as it crosses the bridge. Field names are
//! part of the external contract; the round-trip through the envelope is
//! lossless for everything the wire carries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl From<Event> for EventEnvelope {
    fn from(event: Event) -> Self {
        Self {
            event_id: event.id,
            event_type: event.event_type,
            data: event.data,
            source: event.source,
            timestamp: event.timestamp,
            version: event.version,
            correlation_id: event.correlation_id,
            causation_id: event.causation_id,
            headers: event.headers,
        }
    }
}

impl EventEnvelope {
    /// Rebuild the local event; priority is a local scheduling concern and
    /// is not carried on the wire.
    pub fn into_event(self) -> Event {
        let mut event = Event::new(self.event_type, self.data)
            .with_source(self.source)
            .with_version(self.version)
            .with_headers(self.headers);
        event.id = self.event_id;
        event.timestamp = self.timestamp;
        event.correlation_id = self.correlation_id;
        event.causation_id = self.causation_id;
        event
    }
}

/// Topic for an event type: `prefix + "." + lowercase(type with '_' -> '-')`
pub fn derived_topic(prefix: &str, event_type: &str) -> String {
    format!("{}.{}", prefix, event_type.to_lowercase().replace('_', "-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_wire_fields() {
        let original = Event::new("ORDER_CREATED", serde_json::json!({"orderId": "o-1"}))
            .with_source("order-service")
            .with_correlation(Uuid::new_v4())
            .with_causation(Uuid::new_v4())
            .with_header("tenant", "acme");

        let bytes = serde_json::to_vec(&EventEnvelope::from(original.clone())).unwrap();
        let decoded: EventEnvelope = serde_json::from_slice(&bytes).unwrap();
        let restored = decoded.into_event();

        assert_eq!(restored.id, original.id);
        assert_eq!(restored.event_type, original.event_type);
        assert_eq!(restored.data, original.data);
        assert_eq!(restored.source, original.source);
        assert_eq!(restored.timestamp, original.timestamp);
        assert_eq!(restored.version, original.version);
        assert_eq!(restored.correlation_id, original.correlation_id);
        assert_eq!(restored.causation_id, original.causation_id);
        assert_eq!(restored.headers, original.headers);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let event = Event::new("USER_SIGNED_UP", serde_json::json!({})).with_source("svc");
        let value = serde_json::to_value(EventEnvelope::from(event)).unwrap();

        assert!(value.get("eventId").is_some());
        assert!(value.get("eventType").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("version").is_some());
        assert!(value.get("correlationId").is_none());
    }

    #[test]
    fn topic_naming() {
        assert_eq!(derived_topic("events", "ORDER_CREATED"), "events.order-created");
        assert_eq!(derived_topic("prod", "user_signed_up"), "prod.user-signed-up");
    }
}
