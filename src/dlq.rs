//! Dead-letter queue
//!
//! Stores events whose delivery terminated without success, keeps the
//! failure context, and supports inspection, requeue and purge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::event::Event;

/// Lifecycle of a dead-letter entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Quarantined,
    Failed,
    PendingManual,
    Requeued,
    Purged,
}

/// A failed event with the context of its failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub event: Event,
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: DateTime<Utc>,
    pub attempts: u32,
    pub status: DeadLetterStatus,
    /// Redelivery budget granted when the entry was stored
    pub retry_budget: u32,
}

/// Per-status counters plus total stored
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub total_stored: u64,
    pub by_status: HashMap<String, u64>,
}

#[derive(Default)]
pub struct DeadLetterQueue {
    entries: DashMap<Uuid, DeadLetterEvent>,
    total_stored: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Append an entry; visible to readers as soon as this returns
    pub fn store(&self, entry: DeadLetterEvent) {
        tracing::warn!(
            dead_letter_id = %entry.id,
            event_id = %entry.event.id,
            subscriber = entry.subscriber_id.as_str(),
            reason = entry.error_kind.as_str(),
            attempts = entry.attempts,
            "Event dead-lettered"
        );
        self.total_stored.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(entry.id, entry);
    }

    /// Most recent entries first, up to `limit`
    pub fn list(&self, limit: usize) -> Vec<DeadLetterEvent> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| b.last_attempt.cmp(&a.last_attempt));
        all.truncate(limit);
        all
    }

    pub fn get(&self, id: Uuid) -> Option<DeadLetterEvent> {
        self.entries.get(&id).map(|entry| entry.value().clone())
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    /// Mark an entry requeued and hand back its event for redelivery
    ///
    /// Entries already requeued or purged are not eligible.
    pub fn take_for_requeue(&self, id: Uuid) -> Option<(Uuid, Event)> {
        let mut entry = self.entries.get_mut(&id)?;
        if matches!(
            entry.status,
            DeadLetterStatus::Requeued | DeadLetterStatus::Purged
        ) {
            return None;
        }
        entry.status = DeadLetterStatus::Requeued;
        Some((entry.id, entry.event.clone()))
    }

    /// Drop entries whose last attempt is older than `age`; returns count
    pub fn purge_older_than(&self, age: Duration) -> usize {
        let Ok(age) = chrono::Duration::from_std(age) else {
            return 0;
        };
        let cutoff = Utc::now() - age;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_attempt >= cutoff);
        let purged = before - self.entries.len();
        if purged > 0 {
            tracing::info!(purged = purged, "Dead-letter entries purged");
        }
        purged
    }

    pub fn stats(&self) -> DeadLetterStats {
        let mut by_status: HashMap<String, u64> = HashMap::new();
        for entry in self.entries.iter() {
            let key = format!("{:?}", entry.status);
            *by_status.entry(key).or_default() += 1;
        }
        DeadLetterStats {
            total_stored: self.total_stored.load(Ordering::Relaxed),
            by_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DeadLetterStatus, last_attempt: DateTime<Utc>) -> DeadLetterEvent {
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        DeadLetterEvent {
            id: Uuid::new_v4(),
            event,
            subscription_id: Uuid::new_v4(),
            subscriber_id: "sub".to_string(),
            error_kind: ErrorKind::RetryExhausted,
            error_message: "boom".to_string(),
            first_attempt: last_attempt,
            last_attempt,
            attempts: 3,
            status,
            retry_budget: 0,
        }
    }

    #[test]
    fn store_and_list_newest_first() {
        let dlq = DeadLetterQueue::new();
        let older = entry(
            DeadLetterStatus::Failed,
            Utc::now() - chrono::Duration::minutes(5),
        );
        let newer = entry(DeadLetterStatus::Failed, Utc::now());
        dlq.store(older.clone());
        dlq.store(newer.clone());

        let listed = dlq.list(10);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, newer.id);
        assert_eq!(dlq.count(), 2);
    }

    #[test]
    fn requeue_marks_entry_once() {
        let dlq = DeadLetterQueue::new();
        let stored = entry(DeadLetterStatus::Failed, Utc::now());
        dlq.store(stored.clone());

        let (dl_id, event) = dlq.take_for_requeue(stored.id).unwrap();
        assert_eq!(dl_id, stored.id);
        assert_eq!(event.id, stored.event.id);
        assert_eq!(dlq.get(stored.id).unwrap().status, DeadLetterStatus::Requeued);
        assert!(dlq.take_for_requeue(stored.id).is_none());
    }

    #[test]
    fn purge_respects_age() {
        let dlq = DeadLetterQueue::new();
        dlq.store(entry(
            DeadLetterStatus::Failed,
            Utc::now() - chrono::Duration::hours(2),
        ));
        dlq.store(entry(DeadLetterStatus::Failed, Utc::now()));

        let purged = dlq.purge_older_than(Duration::from_secs(3600));
        assert_eq!(purged, 1);
        assert_eq!(dlq.count(), 1);
    }

    #[test]
    fn stats_count_by_status() {
        let dlq = DeadLetterQueue::new();
        dlq.store(entry(DeadLetterStatus::Quarantined, Utc::now()));
        dlq.store(entry(DeadLetterStatus::Failed, Utc::now()));
        dlq.store(entry(DeadLetterStatus::Failed, Utc::now()));

        let stats = dlq.stats();
        assert_eq!(stats.total_stored, 3);
        assert_eq!(stats.by_status.get("Failed"), Some(&2));
        assert_eq!(stats.by_status.get("Quarantined"), Some(&1));
    }
}
