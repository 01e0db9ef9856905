//! Delivery tasks
//!
//! One delivery task takes an event through the attempt loop for a single
//! subscription: circuit check, timed handler invocation, poison tracking,
//! retry with backoff, and terminal routing to the dead-letter queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::dispatch::BusInner;
use crate::dlq::{DeadLetterEvent, DeadLetterStatus};
use crate::error::{ErrorKind, EventBusError, HandlerError};
use crate::event::{Event, EventPriority};
use crate::poison::PoisonAction;
use crate::subscription::Subscription;
use crate::trace::{SpanRecord, TraceContext};

/// Terminal result of one delivery task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    CircuitRejected,
    Poisoned,
    QueueOverflow,
    /// Subscription deactivated or bus force-stopped before completion
    Skipped,
    Failed {
        kind: ErrorKind,
    },
}

impl DeliveryOutcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, DeliveryOutcome::Delivered | DeliveryOutcome::Skipped)
    }
}

/// Work item queued to an ordered subscription's worker
pub(crate) struct DeliveryJob {
    pub event: Event,
    pub ctx: TraceContext,
    pub done: oneshot::Sender<DeliveryOutcome>,
}

/// Per-subscription result inside a publish summary
#[derive(Debug)]
pub struct DeliveryResult {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub outcome: DeliveryOutcome,
}

/// Aggregate view returned once every matched subscription terminated
#[derive(Debug)]
pub struct PublishSummary {
    pub event_id: Uuid,
    pub results: Vec<DeliveryResult>,
}

impl PublishSummary {
    pub fn delivered(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == DeliveryOutcome::Delivered)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_failure()).count()
    }
}

pub(crate) struct PendingDelivery {
    pub subscription_id: Uuid,
    pub subscriber_id: String,
    pub priority: EventPriority,
    pub dead_letter_enabled: bool,
    pub rx: oneshot::Receiver<DeliveryOutcome>,
}

/// Completion handle returned by `publish`
///
/// Completes once every matched subscription reached a terminal outcome.
/// The aggregate is an error only when a failing subscription had normal
/// or higher priority and no dead-letter routing; everything else is
/// observable through the DLQ and metrics instead.
pub struct PublishHandle {
    pub(crate) event_id: Uuid,
    pub(crate) pending: Vec<PendingDelivery>,
}

impl PublishHandle {
    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    /// How many subscriptions matched the event
    pub fn matched(&self) -> usize {
        self.pending.len()
    }

    pub async fn await_completion(self) -> Result<PublishSummary, EventBusError> {
        let matched = self.pending.len();
        let results = futures::future::join_all(self.pending.into_iter().map(|p| async move {
            let PendingDelivery {
                subscription_id,
                subscriber_id,
                priority,
                dead_letter_enabled,
                rx,
            } = p;
            let outcome = rx.await.unwrap_or(DeliveryOutcome::Skipped);
            (
                DeliveryResult {
                    subscription_id,
                    subscriber_id,
                    outcome,
                },
                priority,
                dead_letter_enabled,
            )
        }))
        .await;

        let hard_failure = results.iter().any(|(result, priority, dead_letter_enabled)| {
            result.outcome.is_failure()
                && *priority >= EventPriority::Normal
                && !dead_letter_enabled
        });
        let results: Vec<DeliveryResult> = results.into_iter().map(|(r, _, _)| r).collect();
        let failed = results.iter().filter(|r| r.outcome.is_failure()).count();

        if hard_failure {
            return Err(EventBusError::PublishFailed { matched, failed });
        }
        Ok(PublishSummary {
            event_id: self.event_id,
            results,
        })
    }
}

fn export_span(
    inner: &BusInner,
    ctx: TraceContext,
    event: &Event,
    subscription: &Subscription,
    attempt: u32,
    started_at: chrono::DateTime<Utc>,
    duration: Duration,
    ok: bool,
) {
    let mut attributes = HashMap::new();
    attributes.insert("event.type".to_string(), event.event_type.clone());
    attributes.insert("event.id".to_string(), event.id.to_string());
    attributes.insert(
        "subscriber.id".to_string(),
        subscription.subscriber_id.clone(),
    );
    attributes.insert("attempt".to_string(), attempt.to_string());

    inner.exporter.export(SpanRecord {
        context: ctx,
        name: "eventbus.deliver".to_string(),
        started_at,
        duration,
        ok,
        attributes,
    });
}

/// Run the full attempt loop for one (event, subscription) pair
pub(crate) async fn deliver(
    inner: &Arc<BusInner>,
    event: &Event,
    subscription: &Arc<Subscription>,
    parent: &TraceContext,
) -> DeliveryOutcome {
    if inner.poison.is_blocked(&event.identity_key()) {
        tracing::debug!(
            event_id = %event.id,
            subscriber = subscription.subscriber_id.as_str(),
            "Skipping delivery of blocked poison event"
        );
        return DeliveryOutcome::Poisoned;
    }

    let policy = &subscription.options.retry_policy;
    let first_attempt = Utc::now();
    let mut forced = inner.shutdown_rx.clone();
    let mut attempt: u32 = 1;

    loop {
        if !subscription.is_active() || *forced.borrow() {
            return DeliveryOutcome::Skipped;
        }

        if !inner.breakers.allow_request(&subscription.subscriber_id) {
            tracing::debug!(
                event_id = %event.id,
                subscriber = subscription.subscriber_id.as_str(),
                "Delivery rejected by open circuit"
            );
            inner
                .metrics
                .record_failed(ErrorKind::CircuitRejected, Duration::ZERO);
            subscription.stats.record_failure();
            return DeliveryOutcome::CircuitRejected;
        }

        let ctx = parent.child();
        let started_at = Utc::now();
        let started = Instant::now();
        let result = tokio::time::timeout(
            subscription.options.timeout,
            (subscription.handler)(event.clone()),
        )
        .await;
        let elapsed = started.elapsed();

        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(HandlerError::timeout(subscription.options.timeout)),
        };
        export_span(
            inner,
            ctx,
            event,
            subscription,
            attempt,
            started_at,
            elapsed,
            error.is_none(),
        );

        let Some(error) = error else {
            inner
                .breakers
                .record_success(&subscription.subscriber_id, elapsed);
            subscription.stats.record_success(elapsed);
            inner.metrics.record_processed(elapsed);
            return DeliveryOutcome::Delivered;
        };

        inner.breakers.record_failure(&subscription.subscriber_id);
        let kind = if error.is_timeout() {
            inner.metrics.record_timeout();
            ErrorKind::Timeout
        } else {
            ErrorKind::ConsumerFailure
        };
        inner.metrics.record_failed(kind, elapsed);
        tracing::warn!(
            event_id = %event.id,
            subscriber = subscription.subscriber_id.as_str(),
            attempt = attempt,
            class = error.class.as_str(),
            error = %error,
            "Delivery attempt failed"
        );

        if let Some(action) =
            inner
                .poison
                .record_failure(event, subscription, &error, attempt, first_attempt)
        {
            if action != PoisonAction::Discard {
                inner.metrics.record_dead_letter(ErrorKind::Poison);
            }
            subscription.stats.record_failure();
            return DeliveryOutcome::Poisoned;
        }

        let retryable = policy.should_retry(&error);
        if retryable && attempt < policy.max_attempts {
            let delay = policy.delay_for(attempt);
            inner.metrics.record_retry(attempt);
            tracing::debug!(
                event_id = %event.id,
                subscriber = subscription.subscriber_id.as_str(),
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = forced.changed() => {
                    if *forced.borrow() {
                        return DeliveryOutcome::Skipped;
                    }
                }
            }
            attempt += 1;
            continue;
        }

        // Terminal failure: exhausted budget or a non-retryable class
        subscription.stats.record_failure();
        let reason = if retryable {
            ErrorKind::RetryExhausted
        } else {
            ErrorKind::NonRetryable
        };
        tracing::warn!(
            event_id = %event.id,
            subscriber = subscription.subscriber_id.as_str(),
            attempts = attempt,
            reason = reason.as_str(),
            "Delivery terminated without success"
        );

        if subscription.options.dead_letter_enabled {
            inner.dlq.store(DeadLetterEvent {
                id: Uuid::new_v4(),
                event: event.clone(),
                subscription_id: subscription.id,
                subscriber_id: subscription.subscriber_id.clone(),
                error_kind: reason,
                error_message: error.to_string(),
                first_attempt,
                last_attempt: Utc::now(),
                attempts: attempt,
                status: DeadLetterStatus::Failed,
                retry_budget: 0,
            });
            inner.metrics.record_dead_letter(reason);
        }
        return DeliveryOutcome::Failed { kind: reason };
    }
}

/// Route an event that could not be queued to an ordered subscription
pub(crate) fn handle_overflow(inner: &Arc<BusInner>, job: DeliveryJob, subscription: &Subscription) {
    tracing::warn!(
        event_id = %job.event.id,
        subscriber = subscription.subscriber_id.as_str(),
        capacity = subscription.options.queue_capacity,
        "Ordered subscription queue full"
    );
    inner
        .metrics
        .record_failed(ErrorKind::QueueOverflow, Duration::ZERO);
    subscription.stats.record_failure();

    let now = Utc::now();
    inner.dlq.store(DeadLetterEvent {
        id: Uuid::new_v4(),
        event: job.event,
        subscription_id: subscription.id,
        subscriber_id: subscription.subscriber_id.clone(),
        error_kind: ErrorKind::QueueOverflow,
        error_message: "ordered subscription queue full".to_string(),
        first_attempt: now,
        last_attempt: now,
        attempts: 0,
        status: DeadLetterStatus::Failed,
        retry_budget: 0,
    });
    inner.metrics.record_dead_letter(ErrorKind::QueueOverflow);
    let _ = job.done.send(DeliveryOutcome::QueueOverflow);
}
