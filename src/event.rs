//! Event model
//!
//! Immutable event record published on the bus. An event is never mutated
//! after construction; the `with_*` methods build a modified copy.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;

/// Delivery priority within a dispatch round
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// An event published on the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub headers: HashMap<String, String>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub priority: EventPriority,
    pub version: String,
}

impl Event {
    /// Create an event with a raw JSON payload
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            headers: HashMap::new(),
            source: String::new(),
            correlation_id: None,
            causation_id: None,
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            version: "1.0".to_string(),
        }
    }

    /// Create an event by serializing a typed payload
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, HandlerError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| HandlerError::serialization(e.to_string()))?;
        Ok(Self::new(event_type, data))
    }

    /// Deserialize the payload back into a typed value
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| HandlerError::serialization(e.to_string()))
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Stable hash over type and payload, used by poison tracking to
    /// recognize the same content across republishes
    pub fn content_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.event_type.hash(&mut hasher);
        self.data.to_string().hash(&mut hasher);
        hasher.finish()
    }

    /// Identity key for failure tracking: type + id + content hash
    pub fn identity_key(&self) -> String {
        format!(
            "{}:{}:{:016x}",
            self.event_type,
            self.id,
            self.content_hash()
        )
    }
}
