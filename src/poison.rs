//! Poison-message handling
//!
//! Tracks failures per event identity and quarantines events whose content
//! cannot plausibly be processed, so they stop consuming retry budget.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dlq::{DeadLetterEvent, DeadLetterQueue, DeadLetterStatus};
use crate::error::{classes, ErrorKind, HandlerError};
use crate::event::Event;
use crate::subscription::Subscription;

/// Error classes that mark content as unprocessable on sight
static POISON_SIGNATURES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        classes::SERIALIZATION,
        classes::PARSE,
        classes::FORMAT,
        classes::ENCODING,
        classes::CAST,
        classes::NUMBER_FORMAT,
    ])
});

/// What to do with an event once it is detected as poison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoisonAction {
    /// Store in the DLQ with zero retries
    Quarantine,
    /// Drop without storage; counted in statistics
    Discard,
    /// Store in the DLQ with a redelivery budget
    MoveToDlq,
    /// Store in the DLQ awaiting an operator decision
    ManualIntervention,
}

/// Immediate detection hook, consulted before the counting rules
pub type PoisonPredicate = Arc<dyn Fn(&Event, &HandlerError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct PoisonPolicy {
    pub max_failures: u32,
    pub max_consecutive_same_error: u32,
    /// Window for the failure-rate rule
    pub failure_rate_window: Duration,
    /// Failures inside the window that trigger detection
    pub max_failures_in_window: u32,
    /// Match against the known-poison signature classes
    pub detect_signatures: bool,
    pub immediate_predicate: Option<PoisonPredicate>,
    pub action: PoisonAction,
    /// Redelivery budget granted by `MoveToDlq`
    pub dlq_retry_budget: u32,
    /// How long failure records are kept per event identity
    pub tracker_retention: Duration,
}

impl Default for PoisonPolicy {
    fn default() -> Self {
        Self {
            max_failures: 10,
            max_consecutive_same_error: 5,
            failure_rate_window: Duration::from_secs(60),
            max_failures_in_window: 8,
            detect_signatures: true,
            immediate_predicate: None,
            action: PoisonAction::Quarantine,
            dlq_retry_budget: 1,
            tracker_retention: Duration::from_secs(3600),
        }
    }
}

impl std::fmt::Debug for PoisonPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoisonPolicy")
            .field("max_failures", &self.max_failures)
            .field(
                "max_consecutive_same_error",
                &self.max_consecutive_same_error,
            )
            .field("failure_rate_window", &self.failure_rate_window)
            .field("max_failures_in_window", &self.max_failures_in_window)
            .field("detect_signatures", &self.detect_signatures)
            .field("immediate_predicate", &self.immediate_predicate.is_some())
            .field("action", &self.action)
            .finish()
    }
}

impl PoisonPolicy {
    pub fn with_action(mut self, action: PoisonAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_immediate_predicate(
        mut self,
        predicate: impl Fn(&Event, &HandlerError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.immediate_predicate = Some(Arc::new(predicate));
        self
    }
}

#[derive(Debug, Clone)]
struct FailureRecord {
    at: DateTime<Utc>,
    class: String,
}

/// Failure history for one event identity
#[derive(Debug, Default)]
struct FailureTracker {
    records: Vec<FailureRecord>,
}

impl FailureTracker {
    fn record(&mut self, class: &str, retention: Duration) {
        let now = Utc::now();
        self.records.push(FailureRecord {
            at: now,
            class: class.to_string(),
        });
        if let Ok(retention) = chrono::Duration::from_std(retention) {
            let cutoff = now - retention;
            self.records.retain(|r| r.at >= cutoff);
        }
    }

    fn total(&self) -> u32 {
        self.records.len() as u32
    }

    fn consecutive_same(&self) -> u32 {
        let Some(last) = self.records.last() else {
            return 0;
        };
        self.records
            .iter()
            .rev()
            .take_while(|r| r.class == last.class)
            .count() as u32
    }

    fn failures_within(&self, window: Duration) -> u32 {
        let Ok(window) = chrono::Duration::from_std(window) else {
            return self.records.len() as u32;
        };
        let cutoff = Utc::now() - window;
        self.records.iter().filter(|r| r.at >= cutoff).count() as u32
    }
}

/// Counters exposed for observability
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoisonStats {
    pub detected: u64,
    pub quarantined: u64,
    pub discarded: u64,
    pub moved_to_dlq: u64,
    pub manual: u64,
}

pub struct PoisonMessageHandler {
    policy: PoisonPolicy,
    trackers: DashMap<String, FailureTracker>,
    blocked: DashMap<String, PoisonAction>,
    dlq: Arc<DeadLetterQueue>,
    detected: AtomicU64,
    quarantined: AtomicU64,
    discarded: AtomicU64,
    moved_to_dlq: AtomicU64,
    manual: AtomicU64,
}

impl PoisonMessageHandler {
    pub fn new(policy: PoisonPolicy, dlq: Arc<DeadLetterQueue>) -> Self {
        Self {
            policy,
            trackers: DashMap::new(),
            blocked: DashMap::new(),
            dlq,
            detected: AtomicU64::new(0),
            quarantined: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            moved_to_dlq: AtomicU64::new(0),
            manual: AtomicU64::new(0),
        }
    }

    /// True when a terminal poison action already fired for this identity;
    /// such events must not be dispatched again.
    pub fn is_blocked(&self, identity_key: &str) -> bool {
        self.blocked.contains_key(identity_key)
    }

    /// Lift the block, e.g. when an operator requeues from the DLQ
    pub fn unblock(&self, identity_key: &str) {
        self.blocked.remove(identity_key);
        self.trackers.remove(identity_key);
    }

    /// Record one failed attempt and decide whether the event is poison.
    ///
    /// Returns the action taken, or None when delivery may continue. The
    /// caller invokes this exactly once per attempt.
    pub fn record_failure(
        &self,
        event: &Event,
        subscription: &Subscription,
        error: &HandlerError,
        attempts: u32,
        first_attempt: DateTime<Utc>,
    ) -> Option<PoisonAction> {
        let key = event.identity_key();
        if self.blocked.contains_key(&key) {
            return self.blocked.get(&key).map(|action| *action);
        }

        let (total, consecutive, in_window) = {
            let mut tracker = self.trackers.entry(key.clone()).or_default();
            tracker.record(&error.class, self.policy.tracker_retention);
            (
                tracker.total(),
                tracker.consecutive_same(),
                tracker.failures_within(self.policy.failure_rate_window),
            )
        };

        let immediate = self
            .policy
            .immediate_predicate
            .as_ref()
            .map(|p| p(event, error))
            .unwrap_or(false);
        let signature =
            self.policy.detect_signatures && POISON_SIGNATURES.contains(error.class.as_str());

        let poison = immediate
            || signature
            || total >= self.policy.max_failures
            || consecutive >= self.policy.max_consecutive_same_error
            || in_window >= self.policy.max_failures_in_window;

        if !poison {
            return None;
        }

        let action = self.policy.action;
        self.blocked.insert(key.clone(), action);
        self.detected.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            class = error.class.as_str(),
            total_failures = total,
            action = ?action,
            "Poison message detected"
        );

        self.apply(action, event, subscription, error, attempts, first_attempt);
        Some(action)
    }

    fn apply(
        &self,
        action: PoisonAction,
        event: &Event,
        subscription: &Subscription,
        error: &HandlerError,
        attempts: u32,
        first_attempt: DateTime<Utc>,
    ) {
        let dead_letter = |status: DeadLetterStatus, retry_budget: u32| DeadLetterEvent {
            id: Uuid::new_v4(),
            event: event.clone(),
            subscription_id: subscription.id,
            subscriber_id: subscription.subscriber_id.clone(),
            error_kind: ErrorKind::Poison,
            error_message: error.to_string(),
            first_attempt,
            last_attempt: Utc::now(),
            attempts,
            status,
            retry_budget,
        };

        match action {
            PoisonAction::Quarantine => {
                self.quarantined.fetch_add(1, Ordering::Relaxed);
                self.dlq.store(dead_letter(DeadLetterStatus::Quarantined, 0));
            }
            PoisonAction::Discard => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
            }
            PoisonAction::MoveToDlq => {
                self.moved_to_dlq.fetch_add(1, Ordering::Relaxed);
                self.dlq.store(dead_letter(
                    DeadLetterStatus::Failed,
                    self.policy.dlq_retry_budget,
                ));
            }
            PoisonAction::ManualIntervention => {
                self.manual.fetch_add(1, Ordering::Relaxed);
                self.dlq
                    .store(dead_letter(DeadLetterStatus::PendingManual, 0));
            }
        }
    }

    /// Drop trackers whose newest record aged out
    pub fn sweep(&self) -> usize {
        let Ok(retention) = chrono::Duration::from_std(self.policy.tracker_retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let before = self.trackers.len();
        self.trackers
            .retain(|_, tracker| tracker.records.iter().any(|r| r.at >= cutoff));
        before - self.trackers.len()
    }

    pub fn stats(&self) -> PoisonStats {
        PoisonStats {
            detected: self.detected.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            moved_to_dlq: self.moved_to_dlq.load(Ordering::Relaxed),
            manual: self.manual.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{HandlerFuture, SubscriptionOptions};

    fn subscription() -> Subscription {
        Subscription::new(
            "sub".to_string(),
            "T".to_string(),
            Arc::new(|_event| Box::pin(async { Ok(()) }) as HandlerFuture),
            SubscriptionOptions::default(),
            0,
        )
    }

    fn handler_under(policy: PoisonPolicy) -> (PoisonMessageHandler, Arc<DeadLetterQueue>) {
        let dlq = DeadLetterQueue::new();
        (PoisonMessageHandler::new(policy, dlq.clone()), dlq)
    }

    #[test]
    fn signature_classes_are_poison_on_first_failure() {
        let (handler, dlq) = handler_under(PoisonPolicy::default());
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        let action = handler.record_failure(
            &event,
            &sub,
            &HandlerError::new(classes::CAST, "bad cast"),
            1,
            Utc::now(),
        );

        assert_eq!(action, Some(PoisonAction::Quarantine));
        assert!(handler.is_blocked(&event.identity_key()));
        let entries = dlq.list(10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, DeadLetterStatus::Quarantined);
        assert_eq!(entries[0].retry_budget, 0);
    }

    #[test]
    fn consecutive_same_errors_trip_detection() {
        let policy = PoisonPolicy {
            max_consecutive_same_error: 3,
            detect_signatures: false,
            ..Default::default()
        };
        let (handler, _dlq) = handler_under(policy);
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();
        let err = HandlerError::transient("same failure");

        assert!(handler
            .record_failure(&event, &sub, &err, 1, Utc::now())
            .is_none());
        assert!(handler
            .record_failure(&event, &sub, &err, 2, Utc::now())
            .is_none());
        assert!(handler
            .record_failure(&event, &sub, &err, 3, Utc::now())
            .is_some());
    }

    #[test]
    fn alternating_errors_reset_consecutive_count() {
        let policy = PoisonPolicy {
            max_consecutive_same_error: 3,
            max_failures: 100,
            max_failures_in_window: 100,
            detect_signatures: false,
            ..Default::default()
        };
        let (handler, _dlq) = handler_under(policy);
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        for attempt in 1..=4 {
            let class = if attempt % 2 == 0 { "a" } else { "b" };
            let err = HandlerError::new(class, "boom");
            assert!(handler
                .record_failure(&event, &sub, &err, attempt, Utc::now())
                .is_none());
        }
    }

    #[test]
    fn discard_skips_dlq_and_counts() {
        let policy = PoisonPolicy::default().with_action(PoisonAction::Discard);
        let (handler, dlq) = handler_under(policy);
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        handler.record_failure(
            &event,
            &sub,
            &HandlerError::serialization("cannot decode"),
            1,
            Utc::now(),
        );

        assert_eq!(dlq.count(), 0);
        assert_eq!(handler.stats().discarded, 1);
    }

    #[test]
    fn immediate_predicate_wins() {
        let policy = PoisonPolicy {
            detect_signatures: false,
            ..Default::default()
        }
        .with_immediate_predicate(|_event, error| error.message.contains("corrupt"));
        let (handler, _dlq) = handler_under(policy);
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        let action = handler.record_failure(
            &event,
            &sub,
            &HandlerError::transient("corrupt frame"),
            1,
            Utc::now(),
        );
        assert!(action.is_some());
    }

    #[test]
    fn unblock_clears_history() {
        let (handler, _dlq) = handler_under(PoisonPolicy::default());
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        handler.record_failure(
            &event,
            &sub,
            &HandlerError::new(classes::PARSE, "bad json"),
            1,
            Utc::now(),
        );
        assert!(handler.is_blocked(&event.identity_key()));

        handler.unblock(&event.identity_key());
        assert!(!handler.is_blocked(&event.identity_key()));
    }

    #[test]
    fn move_to_dlq_grants_budget() {
        let policy = PoisonPolicy {
            dlq_retry_budget: 2,
            ..Default::default()
        }
        .with_action(PoisonAction::MoveToDlq);
        let (handler, dlq) = handler_under(policy);
        let event = Event::new("T", serde_json::json!({})).with_source("test");
        let sub = subscription();

        handler.record_failure(
            &event,
            &sub,
            &HandlerError::new(classes::NUMBER_FORMAT, "NaN"),
            1,
            Utc::now(),
        );

        let entries = dlq.list(1);
        assert_eq!(entries[0].status, DeadLetterStatus::Failed);
        assert_eq!(entries[0].retry_budget, 2);
    }
}
