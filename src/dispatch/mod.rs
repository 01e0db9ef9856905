//! Dispatch engine
//!
//! Looks up subscriptions for a published event, orders them by priority,
//! and runs each delivery independently: ordered subscriptions on a
//! per-subscription FIFO worker, everything else on the shared worker
//! pool. The returned handle completes when every matched subscription
//! reached a terminal outcome.

pub mod delivery;

pub use delivery::{DeliveryOutcome, DeliveryResult, PublishHandle, PublishSummary};

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
use crate::config::BusConfig;
use crate::dispatch::delivery::{DeliveryJob, PendingDelivery};
use crate::dlq::DeadLetterQueue;
use crate::error::{EventBusError, HandlerError, Result};
use crate::event::Event;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::poison::{PoisonMessageHandler, PoisonPolicy, PoisonStats};
use crate::subscription::{
    EventHandler, HandlerFuture, Subscription, SubscriptionInfo, SubscriptionOptions,
    SubscriptionRegistry,
};
use crate::trace::{NoopExporter, SpanExporter, TraceContext};

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) dlq: Arc<DeadLetterQueue>,
    pub(crate) poison: Arc<PoisonMessageHandler>,
    pub(crate) breakers: CircuitBreakerRegistry,
    pub(crate) metrics: Arc<dyn MetricsSink>,
    pub(crate) exporter: Arc<dyn SpanExporter>,
    ordered: DashMap<Uuid, mpsc::Sender<DeliveryJob>>,
    in_flight: AtomicUsize,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
}

/// The event bus
///
/// Cheap to clone; clones share the same registry, queues and sinks.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

pub struct EventBusBuilder {
    config: BusConfig,
    metrics: Arc<dyn MetricsSink>,
    exporter: Arc<dyn SpanExporter>,
    breaker_config: CircuitBreakerConfig,
    poison_policy: PoisonPolicy,
    janitor: bool,
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self {
            config: BusConfig::default(),
            metrics: Arc::new(NoopMetrics),
            exporter: Arc::new(NoopExporter),
            breaker_config: CircuitBreakerConfig::default(),
            poison_policy: PoisonPolicy::default(),
            janitor: true,
        }
    }
}

impl EventBusBuilder {
    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = exporter;
        self
    }

    pub fn with_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn with_poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    /// Skip the periodic cleanup task; callers then run
    /// `cleanup_inactive` and tracker sweeps themselves.
    pub fn without_janitor(mut self) -> Self {
        self.janitor = false;
        self
    }

    /// Build the bus. Must be called within a tokio runtime: background
    /// workers are spawned on it.
    pub fn build(self) -> EventBus {
        let dlq = DeadLetterQueue::new();
        let poison = Arc::new(PoisonMessageHandler::new(self.poison_policy, dlq.clone()));

        let transition_metrics = self.metrics.clone();
        let breakers = CircuitBreakerRegistry::new(self.breaker_config).with_observer(Arc::new(
            move |subscriber: &str, from: CircuitState, to: CircuitState| {
                transition_metrics.record_circuit_transition(subscriber, from, to);
            },
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bus = EventBus {
            inner: Arc::new(BusInner {
                config: self.config,
                registry: SubscriptionRegistry::new(),
                dlq,
                poison,
                breakers,
                metrics: self.metrics,
                exporter: self.exporter,
                ordered: DashMap::new(),
                in_flight: AtomicUsize::new(0),
                accepting: AtomicBool::new(true),
                shutdown_tx,
                shutdown_rx,
            }),
        };

        if self.janitor {
            bus.spawn_janitor();
        }
        bus
    }
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    fn spawn_janitor(&self) {
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(inner.config.janitor_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let removed = inner.registry.cleanup_inactive();
                        let swept = inner.poison.sweep();
                        if removed > 0 || swept > 0 {
                            tracing::debug!(
                                subscriptions_removed = removed,
                                trackers_swept = swept,
                                "Janitor pass"
                            );
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Register a handler for an event type
    ///
    /// The subscription is eligible for dispatch of any event published
    /// after this returns.
    pub fn subscribe<F, Fut>(
        &self,
        event_type: impl Into<String>,
        subscriber_id: impl Into<String>,
        options: SubscriptionOptions,
        handler: F,
    ) -> Result<Arc<Subscription>>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(EventBusError::Validation(
                "event type must not be empty".to_string(),
            ));
        }
        let subscriber_id = subscriber_id.into();
        if subscriber_id.trim().is_empty() {
            return Err(EventBusError::Validation(
                "subscriber id must not be empty".to_string(),
            ));
        }

        let handler: EventHandler =
            Arc::new(move |event| Box::pin(handler(event)) as HandlerFuture);
        Ok(self
            .inner
            .registry
            .subscribe(event_type, subscriber_id, options, handler))
    }

    /// Subscription options seeded from the bus configuration
    pub fn default_options(&self) -> SubscriptionOptions {
        SubscriptionOptions::default()
            .with_timeout(self.inner.config.default_timeout)
            .with_queue_capacity(self.inner.config.default_queue_capacity)
    }

    /// Remove one subscription; in-flight attempts are not cancelled but
    /// subsequent attempts are skipped.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.inner.ordered.remove(&id);
        self.inner.registry.unsubscribe(id)
    }

    /// Remove every subscription of a subscriber group
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let subscriptions = self.inner.registry.list_by_subscriber(subscriber_id);
        subscriptions
            .into_iter()
            .filter(|s| self.unsubscribe(s.id))
            .count()
    }

    /// Publish an event to every matching subscription
    ///
    /// Validation failures surface here synchronously; per-subscription
    /// failures are reported through the returned handle, the DLQ and the
    /// metrics sink.
    pub fn publish(&self, event: Event) -> Result<PublishHandle> {
        if !self.inner.accepting.load(Ordering::Acquire) {
            return Err(EventBusError::ShuttingDown);
        }
        if event.event_type.trim().is_empty() {
            return Err(EventBusError::Validation(
                "event type must not be empty".to_string(),
            ));
        }
        if event.source.trim().is_empty() {
            return Err(EventBusError::Validation(
                "event source must not be empty".to_string(),
            ));
        }

        let mut event = event;
        let ctx = match TraceContext::from_headers(&event.headers) {
            Some(parent) => parent.child(),
            None => TraceContext::new_root(),
        };
        ctx.inject(&mut event.headers);

        self.inner.metrics.record_published();
        let subscriptions = self.inner.registry.snapshot_for(&event);
        tracing::debug!(
            event_id = %event.id,
            event_type = event.event_type.as_str(),
            matched = subscriptions.len(),
            "Publishing event"
        );

        let mut pending = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let (tx, rx) = oneshot::channel();
            pending.push(PendingDelivery {
                subscription_id: subscription.id,
                subscriber_id: subscription.subscriber_id.clone(),
                priority: subscription.options.priority,
                dead_letter_enabled: subscription.options.dead_letter_enabled,
                rx,
            });
            self.submit(event.clone(), subscription, ctx.clone(), tx);
        }

        Ok(PublishHandle {
            event_id: event.id,
            pending,
        })
    }

    fn submit(
        &self,
        event: Event,
        subscription: Arc<Subscription>,
        ctx: TraceContext,
        done: oneshot::Sender<DeliveryOutcome>,
    ) {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);

        if subscription.options.ordered {
            let sender = self.ordered_sender(&subscription);
            let job = DeliveryJob { event, ctx, done };
            match sender.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => {
                    self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    delivery::handle_overflow(&self.inner, job, &subscription);
                }
                Err(mpsc::error::TrySendError::Closed(job)) => {
                    self.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = job.done.send(DeliveryOutcome::Skipped);
                }
            }
        } else {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let outcome = delivery::deliver(&inner, &event, &subscription, &ctx).await;
                inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                let _ = done.send(outcome);
            });
        }
    }

    /// Queue sender for an ordered subscription, spawning its worker on
    /// first use. Enqueueing inside `publish` preserves publish order.
    fn ordered_sender(&self, subscription: &Arc<Subscription>) -> mpsc::Sender<DeliveryJob> {
        match self.inner.ordered.entry(subscription.id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, mut rx) = mpsc::channel(subscription.options.queue_capacity);
                entry.insert(tx.clone());

                let inner = self.inner.clone();
                let subscription = subscription.clone();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        let outcome =
                            delivery::deliver(&inner, &job.event, &subscription, &job.ctx).await;
                        inner.in_flight.fetch_sub(1, Ordering::SeqCst);
                        let _ = job.done.send(outcome);
                    }
                });
                tx
            }
        }
    }

    /// Re-emit a dead-lettered event with a fresh attempt budget; the
    /// republished event's causation id is the dead-letter id.
    pub fn requeue_dead_letter(&self, id: Uuid) -> Result<PublishHandle> {
        let (dead_letter_id, event) = self
            .inner
            .dlq
            .take_for_requeue(id)
            .ok_or(EventBusError::DeadLetterNotFound(id))?;
        self.inner.poison.unblock(&event.identity_key());
        self.publish(event.with_causation(dead_letter_id))
    }

    pub fn get_subscription_stats(&self) -> Vec<SubscriptionInfo> {
        self.inner.registry.stats_snapshot()
    }

    pub fn dead_letter_queue(&self) -> Arc<DeadLetterQueue> {
        self.inner.dlq.clone()
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.inner.metrics.clone()
    }

    pub fn poison_stats(&self) -> PoisonStats {
        self.inner.poison.stats()
    }

    pub fn circuit_state(&self, subscriber_id: &str) -> CircuitState {
        self.inner.breakers.state(subscriber_id)
    }

    /// Subscriptions currently registered
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Watch receiver that flips when the bus force-stops; background
    /// collaborators (outbox worker, inbound consumer) select on it.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown_rx.clone()
    }

    /// Stop intake, drain in-flight deliveries up to the configured
    /// deadline, then force-stop cooperatively.
    pub async fn shutdown(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        tracing::info!("Event bus shutting down, draining in-flight deliveries");

        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout;
        while self.inner.in_flight.load(Ordering::SeqCst) > 0
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let remaining = self.inner.in_flight.load(Ordering::SeqCst);
        if remaining > 0 {
            tracing::warn!(
                remaining = remaining,
                "Shutdown deadline reached with deliveries still in flight"
            );
        }
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.ordered.clear();
        tracing::info!("Event bus stopped");
    }
}
