//! Outbox publisher
//!
//! Background worker that replays stored entries against a publish target
//! until each is published, with bounded exponential backoff between
//! attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::dispatch::EventBus;
use crate::event::Event;
use crate::kafka::TransportError;
use crate::outbox::{OutboxEntry, OutboxError, OutboxStatus, OutboxStore};

/// Where replayed events go: the local dispatch engine or a bridge
#[async_trait]
pub trait PublishTarget: Send + Sync {
    async fn deliver(&self, event: Event) -> Result<(), TransportError>;
}

/// Target that feeds entries back into the local dispatch engine
pub struct LocalPublishTarget {
    bus: EventBus,
}

impl LocalPublishTarget {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl PublishTarget for LocalPublishTarget {
    async fn deliver(&self, event: Event) -> Result<(), TransportError> {
        let handle = self
            .bus
            .publish(event)
            .map_err(|e| TransportError::LocalPublish(e.to_string()))?;
        handle
            .await_completion()
            .await
            .map(|_| ())
            .map_err(|e| TransportError::LocalPublish(e.to_string()))
    }
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    target: Arc<dyn PublishTarget>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        target: Arc<dyn PublishTarget>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            target,
            config,
        }
    }

    /// Durably record an event for publication; the entry is persisted
    /// before this returns.
    pub async fn store_for_publishing(&self, event: Event) -> Result<OutboxEntry, OutboxError> {
        let entry = OutboxEntry::new(event);
        self.store.insert(entry.clone()).await?;
        tracing::debug!(outbox_id = %entry.id, event_id = %entry.event.id, "Event stored for publishing");
        Ok(entry)
    }

    /// Record an event that must not publish before `not_before`
    pub async fn schedule_for_publishing(
        &self,
        event: Event,
        not_before: DateTime<Utc>,
    ) -> Result<OutboxEntry, OutboxError> {
        let entry = OutboxEntry::scheduled(event, not_before);
        self.store.insert(entry.clone()).await?;
        Ok(entry)
    }

    fn backoff(&self, retry_count: u32) -> Duration {
        let base = self.config.initial_backoff.as_secs_f64() * 2f64.powi(retry_count as i32);
        Duration::from_secs_f64(base.min(self.config.max_backoff.as_secs_f64()))
    }

    /// One poll round: attempt every due entry, honouring the retry budget.
    /// Returns how many entries were published.
    pub async fn process_ready_events(&self) -> Result<usize, OutboxError> {
        let now = Utc::now();
        let ready = self
            .store
            .fetch_ready(self.config.batch_size, now, self.config.max_retries)
            .await?;

        let mut published = 0;
        for mut entry in ready {
            entry.status = OutboxStatus::Publishing;
            entry.last_attempt_at = Some(Utc::now());
            self.store.update(entry.clone()).await?;

            match self.target.deliver(entry.event.clone()).await {
                Ok(()) => {
                    entry.status = OutboxStatus::Published;
                    entry.last_error = None;
                    self.store.update(entry.clone()).await?;
                    published += 1;
                    tracing::debug!(outbox_id = %entry.id, "Outbox entry published");
                }
                Err(e) => {
                    entry.retry_count += 1;
                    entry.status = OutboxStatus::Failed;
                    entry.last_error = Some(e.to_string());
                    // Push the next attempt out; exhausted entries rest in
                    // FAILED until retry_failed_events re-arms them.
                    if entry.retry_count < self.config.max_retries {
                        entry.scheduled_at = Utc::now() + chrono::Duration::from_std(
                            self.backoff(entry.retry_count),
                        )
                        .unwrap_or_else(|_| chrono::Duration::zero());
                    }
                    tracing::warn!(
                        outbox_id = %entry.id,
                        retry_count = entry.retry_count,
                        error = %e,
                        "Outbox publish attempt failed"
                    );
                    self.store.update(entry).await?;
                }
            }
        }
        Ok(published)
    }

    /// Re-arm entries that exhausted their retry budget
    pub async fn retry_failed_events(&self) -> Result<usize, OutboxError> {
        let failed = self
            .store
            .fetch_by_status(OutboxStatus::Failed, usize::MAX)
            .await?;
        let mut rearmed = 0;
        for mut entry in failed {
            entry.status = OutboxStatus::Pending;
            entry.retry_count = 0;
            entry.scheduled_at = Utc::now();
            self.store.update(entry).await?;
            rearmed += 1;
        }
        Ok(rearmed)
    }

    pub async fn mark_as_published(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut entry = self.store.get(id).await?.ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Published;
        entry.last_attempt_at = Some(Utc::now());
        self.store.update(entry).await
    }

    pub async fn mark_as_failed(&self, id: Uuid, error: impl Into<String>) -> Result<(), OutboxError> {
        let mut entry = self.store.get(id).await?.ok_or(OutboxError::NotFound(id))?;
        entry.status = OutboxStatus::Failed;
        entry.retry_count += 1;
        entry.last_error = Some(error.into());
        entry.last_attempt_at = Some(Utc::now());
        self.store.update(entry).await
    }

    /// Cancel an entry that has not reached a terminal status
    pub async fn cancel_event(&self, id: Uuid) -> Result<(), OutboxError> {
        let mut entry = self.store.get(id).await?.ok_or(OutboxError::NotFound(id))?;
        if matches!(entry.status, OutboxStatus::Published | OutboxStatus::Cancelled) {
            return Err(OutboxError::InvalidTransition {
                id,
                status: entry.status,
                requested: OutboxStatus::Cancelled,
            });
        }
        entry.status = OutboxStatus::Cancelled;
        self.store.update(entry).await
    }

    /// Drop PUBLISHED and CANCELLED entries older than the retention period
    pub async fn cleanup_old_events(&self) -> Result<usize, OutboxError> {
        let Ok(retention) = chrono::Duration::from_std(self.config.retention) else {
            return Ok(0);
        };
        let cutoff = Utc::now() - retention;
        self.store
            .delete_older_than(&[OutboxStatus::Published, OutboxStatus::Cancelled], cutoff)
            .await
    }

    /// Background loop: poll for ready entries and clean up on each tick
    /// until the shutdown signal flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Outbox publisher started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.process_ready_events().await {
                        tracing::error!(error = %e, "Outbox poll failed");
                    }
                    if let Err(e) = self.cleanup_old_events().await {
                        tracing::error!(error = %e, "Outbox cleanup failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Outbox publisher stopping");
                        break;
                    }
                }
            }
        }
    }
}
