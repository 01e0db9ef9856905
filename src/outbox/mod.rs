//! Outbox
//!
//! Durable queue of events awaiting publication, decoupling state changes
//! from delivery for at-least-once publication across crashes. The storage
//! contract is pluggable; an in-memory store ships with the crate.

pub mod publisher;

pub use publisher::{LocalPublishTarget, OutboxPublisher, PublishTarget};

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::event::Event;

/// Publication lifecycle of an outbox entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    Pending,
    Scheduled,
    Publishing,
    Published,
    Failed,
    Cancelled,
}

/// An event parked in the outbox until publication succeeds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event: Event,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    /// Not published before this instant
    pub scheduled_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    pub fn new(event: Event) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event,
            status: OutboxStatus::Pending,
            created_at: now,
            scheduled_at: now,
            last_attempt_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn scheduled(event: Event, not_before: DateTime<Utc>) -> Self {
        Self {
            status: OutboxStatus::Scheduled,
            scheduled_at: not_before,
            ..Self::new(event)
        }
    }
}

/// Storage errors for the outbox contract
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Outbox entry not found: {0}")]
    NotFound(Uuid),

    #[error("Entry {id} is {status:?} and cannot transition to {requested:?}")]
    InvalidTransition {
        id: Uuid,
        status: OutboxStatus,
        requested: OutboxStatus,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Persistence contract for outbox entries
///
/// Implementations must make `insert` durable before returning so the
/// at-least-once guarantee holds across a crash of the publishing process.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, entry: OutboxEntry) -> Result<(), OutboxError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError>;

    /// Replace the stored entry with the same id
    async fn update(&self, entry: OutboxEntry) -> Result<(), OutboxError>;

    /// Entries due for a publish attempt: PENDING and SCHEDULED entries, plus
    /// FAILED entries that still have retry budget, with `scheduled_at <= now`,
    /// oldest schedule first.
    async fn fetch_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    async fn fetch_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError>;

    /// Delete entries in any of `statuses` created before `cutoff`
    async fn delete_older_than(
        &self,
        statuses: &[OutboxStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxError>;

    async fn count_by_status(&self) -> Result<HashMap<OutboxStatus, usize>, OutboxError>;
}

/// In-memory store, the default binding and the reference for the contract
#[derive(Default)]
pub struct InMemoryOutboxStore {
    entries: RwLock<HashMap<Uuid, OutboxEntry>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>, OutboxError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn update(&self, entry: OutboxEntry) -> Result<(), OutboxError> {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry;
                Ok(())
            }
            None => Err(OutboxError::NotFound(entry.id)),
        }
    }

    async fn fetch_ready(
        &self,
        limit: usize,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.entries.read().await;
        let mut ready: Vec<_> = entries
            .values()
            .filter(|e| e.scheduled_at <= now)
            .filter(|e| match e.status {
                OutboxStatus::Pending | OutboxStatus::Scheduled => true,
                OutboxStatus::Failed => e.retry_count < max_retries,
                _ => false,
            })
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn fetch_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        let entries = self.entries.read().await;
        let mut matched: Vec<_> = entries
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn delete_older_than(
        &self,
        statuses: &[OutboxStatus],
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !(statuses.contains(&e.status) && e.created_at < cutoff));
        Ok(before - entries.len())
    }

    async fn count_by_status(&self) -> Result<HashMap<OutboxStatus, usize>, OutboxError> {
        let entries = self.entries.read().await;
        let mut counts = HashMap::new();
        for entry in entries.values() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event::new("T", serde_json::json!({"n": 1})).with_source("test")
    }

    #[tokio::test]
    async fn fetch_ready_honours_schedule_and_budget() {
        let store = InMemoryOutboxStore::new();
        let due = OutboxEntry::new(event());
        let future = OutboxEntry::scheduled(event(), Utc::now() + chrono::Duration::hours(1));
        let mut exhausted = OutboxEntry::new(event());
        exhausted.status = OutboxStatus::Failed;
        exhausted.retry_count = 5;
        let mut retryable = OutboxEntry::new(event());
        retryable.status = OutboxStatus::Failed;
        retryable.retry_count = 2;

        for e in [&due, &future, &exhausted, &retryable] {
            store.insert(e.clone()).await.unwrap();
        }

        let ready = store.fetch_ready(10, Utc::now(), 5).await.unwrap();
        let ids: Vec<_> = ready.iter().map(|e| e.id).collect();
        assert!(ids.contains(&due.id));
        assert!(ids.contains(&retryable.id));
        assert!(!ids.contains(&future.id));
        assert!(!ids.contains(&exhausted.id));
    }

    #[tokio::test]
    async fn update_requires_existing_entry() {
        let store = InMemoryOutboxStore::new();
        let entry = OutboxEntry::new(event());
        assert!(matches!(
            store.update(entry).await,
            Err(OutboxError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_older_than_filters_by_status() {
        let store = InMemoryOutboxStore::new();
        let mut published = OutboxEntry::new(event());
        published.status = OutboxStatus::Published;
        published.created_at = Utc::now() - chrono::Duration::hours(2);
        let mut pending = OutboxEntry::new(event());
        pending.created_at = Utc::now() - chrono::Duration::hours(2);

        store.insert(published).await.unwrap();
        store.insert(pending.clone()).await.unwrap();

        let removed = store
            .delete_older_than(
                &[OutboxStatus::Published, OutboxStatus::Cancelled],
                Utc::now() - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(pending.id).await.unwrap().is_some());
    }
}
