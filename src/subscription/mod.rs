//! Subscriptions
//!
//! A subscription binds a handler to an event type with delivery options
//! and per-subscription statistics.

pub mod registry;

pub use registry::SubscriptionRegistry;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::event::{Event, EventPriority};
use crate::retry::RetryPolicy;

/// Boxed future returned by an event handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;

/// Type-erased event handler
pub type EventHandler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// Predicate applied before dispatching to a subscription
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Delivery options for one subscription
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Drop events the predicate rejects, silently
    pub filter: Option<EventFilter>,
    /// Ordering of subscriptions within a dispatch round
    pub priority: EventPriority,
    /// Serialize delivery in publish order
    pub ordered: bool,
    /// Per-attempt timeout
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Route terminal failures to the dead-letter queue
    pub dead_letter_enabled: bool,
    /// Bound of the FIFO queue backing an ordered subscription
    pub queue_capacity: usize,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            filter: None,
            priority: EventPriority::Normal,
            ordered: false,
            timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            dead_letter_enabled: true,
            queue_capacity: 1024,
        }
    }
}

impl std::fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("filter", &self.filter.is_some())
            .field("priority", &self.priority)
            .field("ordered", &self.ordered)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("dead_letter_enabled", &self.dead_letter_enabled)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl SubscriptionOptions {
    pub fn with_filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter_enabled = false;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }
}

/// Per-subscription delivery counters, updated atomically
#[derive(Debug, Default)]
pub struct SubscriptionStats {
    processed: AtomicU64,
    failed: AtomicU64,
    total_latency_micros: AtomicU64,
    last_processed_millis: AtomicI64,
}

impl SubscriptionStats {
    pub fn record_success(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.last_processed_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let processed = self.processed.load(Ordering::Relaxed);
        let total_micros = self.total_latency_micros.load(Ordering::Relaxed);
        let last_millis = self.last_processed_millis.load(Ordering::Relaxed);

        StatsSnapshot {
            processed,
            failed: self.failed.load(Ordering::Relaxed),
            avg_latency_ms: if processed > 0 {
                total_micros as f64 / processed as f64 / 1000.0
            } else {
                0.0
            },
            last_processed: if last_millis > 0 {
                Utc.timestamp_millis_opt(last_millis).single()
            } else {
                None
            },
        }
    }
}

/// Serializable view of `SubscriptionStats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub last_processed: Option<DateTime<Utc>>,
}

/// A live binding of a handler to an event type
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_id: String,
    pub event_type: String,
    pub options: SubscriptionOptions,
    pub stats: SubscriptionStats,
    pub(crate) handler: EventHandler,
    active: AtomicBool,
    /// Registration order, used for stable priority ties
    pub(crate) seq: u64,
}

impl Subscription {
    pub(crate) fn new(
        subscriber_id: String,
        event_type: String,
        handler: EventHandler,
        options: SubscriptionOptions,
        seq: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscriber_id,
            event_type,
            options,
            stats: SubscriptionStats::default(),
            handler,
            active: AtomicBool::new(true),
            seq,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Run the filter against an event; no filter accepts everything
    pub fn matches(&self, event: &Event) -> bool {
        match &self.options.filter {
            Some(filter) => filter(event),
            None => true,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("event_type", &self.event_type)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Snapshot row returned by `get_subscription_stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: Uuid,
    pub subscriber_id: String,
    pub event_type: String,
    pub active: bool,
    pub stats: StatsSnapshot,
}
