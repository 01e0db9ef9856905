//! Subscription registry
//!
//! Type-to-subscription index with copy-on-write lists per event type, so
//! dispatch iterates a stable snapshot while subscribe/unsubscribe swap
//! the list underneath.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::event::Event;
use crate::subscription::{
    EventHandler, Subscription, SubscriptionInfo, SubscriptionOptions,
};

#[derive(Default)]
pub struct SubscriptionRegistry {
    by_type: DashMap<String, Arc<Vec<Arc<Subscription>>>>,
    by_id: DashMap<Uuid, Arc<Subscription>>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; the subscription is eligible for dispatch of any
    /// subsequently published event as soon as this returns.
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        subscriber_id: impl Into<String>,
        options: SubscriptionOptions,
        handler: EventHandler,
    ) -> Arc<Subscription> {
        let event_type = event_type.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(Subscription::new(
            subscriber_id.into(),
            event_type.clone(),
            handler,
            options,
            seq,
        ));

        self.by_id.insert(subscription.id, subscription.clone());
        self.by_type
            .entry(event_type)
            .and_modify(|list| {
                let mut next = list.as_ref().clone();
                next.push(subscription.clone());
                *list = Arc::new(next);
            })
            .or_insert_with(|| Arc::new(vec![subscription.clone()]));

        tracing::debug!(
            subscription_id = %subscription.id,
            subscriber = subscription.subscriber_id.as_str(),
            event_type = subscription.event_type.as_str(),
            "Subscription registered"
        );

        subscription
    }

    /// Deactivate and remove one subscription
    ///
    /// An in-flight delivery attempt is not cancelled, but subsequent
    /// attempts observe the deactivation and are skipped.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let Some((_, subscription)) = self.by_id.remove(&id) else {
            return false;
        };
        subscription.deactivate();

        if let Some(mut list) = self.by_type.get_mut(&subscription.event_type) {
            let next: Vec<_> = list
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect();
            *list = Arc::new(next);
        }

        tracing::debug!(subscription_id = %id, "Subscription removed");
        true
    }

    /// Remove every subscription of a subscriber group; returns the count
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().subscriber_id == subscriber_id)
            .map(|entry| *entry.key())
            .collect();

        ids.into_iter().filter(|id| self.unsubscribe(*id)).count()
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Subscription>> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    /// Stable snapshot of the subscriptions for one event type
    pub fn list_by_type(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.by_type
            .get(event_type)
            .map(|list| list.as_ref().clone())
            .unwrap_or_default()
    }

    pub fn list_by_subscriber(&self, subscriber_id: &str) -> Vec<Arc<Subscription>> {
        self.by_id
            .iter()
            .filter(|entry| entry.value().subscriber_id == subscriber_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Active subscriptions matching an event, sorted for dispatch:
    /// descending priority, registration order on ties.
    pub fn snapshot_for(&self, event: &Event) -> Vec<Arc<Subscription>> {
        let mut matched: Vec<_> = self
            .list_by_type(&event.event_type)
            .into_iter()
            .filter(|s| s.is_active() && s.matches(event))
            .collect();
        matched.sort_by(|a, b| {
            b.options
                .priority
                .cmp(&a.options.priority)
                .then(a.seq.cmp(&b.seq))
        });
        matched
    }

    /// Drop subscriptions that were deactivated without being removed
    pub fn cleanup_inactive(&self) -> usize {
        let mut removed = 0;
        for mut entry in self.by_type.iter_mut() {
            let before = entry.value().len();
            if entry.iter().any(|s| !s.is_active()) {
                let next: Vec<_> = entry
                    .value()
                    .iter()
                    .filter(|s| s.is_active())
                    .cloned()
                    .collect();
                removed += before - next.len();
                *entry.value_mut() = Arc::new(next);
            }
        }
        self.by_id.retain(|_, s| s.is_active());
        removed
    }

    pub fn stats_snapshot(&self) -> Vec<SubscriptionInfo> {
        self.by_id
            .iter()
            .map(|entry| {
                let s = entry.value();
                SubscriptionInfo {
                    id: s.id,
                    subscriber_id: s.subscriber_id.clone(),
                    event_type: s.event_type.clone(),
                    active: s.is_active(),
                    stats: s.stats.snapshot(),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventPriority;
    use crate::subscription::HandlerFuture;

    fn noop_handler() -> EventHandler {
        Arc::new(|_event| Box::pin(async { Ok(()) }) as HandlerFuture)
    }

    fn event(event_type: &str) -> Event {
        Event::new(event_type, serde_json::json!({})).with_source("test")
    }

    #[test]
    fn subscribe_and_list() {
        let registry = SubscriptionRegistry::new();
        let sub = registry.subscribe(
            "ORDER_CREATED",
            "billing",
            SubscriptionOptions::default(),
            noop_handler(),
        );

        assert_eq!(registry.list_by_type("ORDER_CREATED").len(), 1);
        assert_eq!(registry.list_by_subscriber("billing")[0].id, sub.id);
        assert!(registry.list_by_type("OTHER").is_empty());
    }

    #[test]
    fn unsubscribe_removes_and_deactivates() {
        let registry = SubscriptionRegistry::new();
        let sub = registry.subscribe(
            "ORDER_CREATED",
            "billing",
            SubscriptionOptions::default(),
            noop_handler(),
        );

        assert!(registry.unsubscribe(sub.id));
        assert!(!sub.is_active());
        assert!(registry.list_by_type("ORDER_CREATED").is_empty());
        assert!(!registry.unsubscribe(sub.id));
    }

    #[test]
    fn unsubscribe_all_counts() {
        let registry = SubscriptionRegistry::new();
        for event_type in ["A", "B", "C"] {
            registry.subscribe(
                event_type,
                "billing",
                SubscriptionOptions::default(),
                noop_handler(),
            );
        }
        registry.subscribe("A", "other", SubscriptionOptions::default(), noop_handler());

        assert_eq!(registry.unsubscribe_all("billing"), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_sorts_by_priority_then_registration() {
        let registry = SubscriptionRegistry::new();
        let low = registry.subscribe(
            "T",
            "s1",
            SubscriptionOptions::default().with_priority(EventPriority::Low),
            noop_handler(),
        );
        let normal_first = registry.subscribe(
            "T",
            "s2",
            SubscriptionOptions::default(),
            noop_handler(),
        );
        let normal_second = registry.subscribe(
            "T",
            "s3",
            SubscriptionOptions::default(),
            noop_handler(),
        );
        let high = registry.subscribe(
            "T",
            "s4",
            SubscriptionOptions::default().with_priority(EventPriority::High),
            noop_handler(),
        );

        let order: Vec<Uuid> = registry
            .snapshot_for(&event("T"))
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(order, vec![high.id, normal_first.id, normal_second.id, low.id]);
    }

    #[test]
    fn snapshot_applies_filter() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(
            "T",
            "s1",
            SubscriptionOptions::default()
                .with_filter(|e: &Event| e.data.get("want").is_some()),
            noop_handler(),
        );

        assert!(registry.snapshot_for(&event("T")).is_empty());

        let matching = Event::new("T", serde_json::json!({"want": true})).with_source("test");
        assert_eq!(registry.snapshot_for(&matching).len(), 1);
    }

    #[test]
    fn cleanup_sweeps_deactivated() {
        let registry = SubscriptionRegistry::new();
        let sub = registry.subscribe("T", "s1", SubscriptionOptions::default(), noop_handler());
        registry.subscribe("T", "s2", SubscriptionOptions::default(), noop_handler());

        // deactivate without removal, as dispatch-time termination does
        sub.deactivate();
        assert_eq!(registry.cleanup_inactive(), 1);
        assert_eq!(registry.list_by_type("T").len(), 1);
        assert_eq!(registry.len(), 1);
    }
}
