//! Outbox replay and bridge forwarding scenarios

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventbus::{
    Event, EventBus, EventEnvelope, InMemoryOutboxStore, KafkaBridge, LocalPublishTarget,
    OutboxConfig, OutboxPublisher, OutboxStatus, OutboxStore, PublishTarget, SubscriptionOptions,
    TransportError,
};
use eventbus::kafka::MemoryTransport;

fn config() -> OutboxConfig {
    OutboxConfig {
        poll_interval: Duration::from_millis(50),
        batch_size: 10,
        max_retries: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(100),
        retention: Duration::from_secs(3600),
    }
}

fn event() -> Event {
    Event::new("ORDER_CREATED", serde_json::json!({"orderId": "o-3"})).with_source("orders")
}

/// Target that fails a configurable number of times before succeeding
struct FlakyTarget {
    failures_left: AtomicU32,
    delivered: AtomicU32,
}

impl FlakyTarget {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: AtomicU32::new(failures),
            delivered: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PublishTarget for FlakyTarget {
    async fn deliver(&self, _event: Event) -> Result<(), TransportError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Kafka("broker unavailable".to_string()));
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn store_then_replay_to_local_bus() {
    let bus = EventBus::builder().build();
    let invocations = Arc::new(AtomicU32::new(0));

    let seen = invocations.clone();
    bus.subscribe(
        "ORDER_CREATED",
        "billing",
        SubscriptionOptions::default(),
        move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .unwrap();

    let store = Arc::new(InMemoryOutboxStore::new());
    let publisher = OutboxPublisher::new(
        store.clone(),
        Arc::new(LocalPublishTarget::new(bus.clone())),
        config(),
    );

    let entry = publisher.store_for_publishing(event()).await.unwrap();
    assert_eq!(entry.status, OutboxStatus::Pending);

    let published = publisher.process_ready_events().await.unwrap();
    assert_eq!(published, 1);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get(entry.id).await.unwrap().unwrap().status,
        OutboxStatus::Published
    );
}

#[tokio::test]
async fn failed_publish_backs_off_then_succeeds() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let target = Arc::new(FlakyTarget::new(1));
    let publisher = OutboxPublisher::new(store.clone(), target.clone(), config());

    let entry = publisher.store_for_publishing(event()).await.unwrap();

    // First round fails and pushes the next attempt out
    assert_eq!(publisher.process_ready_events().await.unwrap(), 0);
    let stored = store.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.last_error.is_some());

    // Not ready again until the backoff elapses
    assert_eq!(publisher.process_ready_events().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(publisher.process_ready_events().await.unwrap(), 1);
    assert_eq!(target.delivered.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get(entry.id).await.unwrap().unwrap().status,
        OutboxStatus::Published
    );
}

#[tokio::test]
async fn exhausted_entries_rest_until_rearmed() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let target = Arc::new(FlakyTarget::new(u32::MAX));
    let publisher = OutboxPublisher::new(store.clone(), target.clone(), config());

    let entry = publisher.store_for_publishing(event()).await.unwrap();
    for _ in 0..5 {
        publisher.process_ready_events().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let stored = store.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Failed);
    assert_eq!(stored.retry_count, 3);

    // Re-arming grants a fresh budget
    assert_eq!(publisher.retry_failed_events().await.unwrap(), 1);
    let stored = store.get(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Pending);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn scheduled_events_wait_for_their_time() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let target = Arc::new(FlakyTarget::new(0));
    let publisher = OutboxPublisher::new(store.clone(), target.clone(), config());

    let entry = publisher
        .schedule_for_publishing(event(), chrono::Utc::now() + chrono::Duration::milliseconds(80))
        .await
        .unwrap();
    assert_eq!(entry.status, OutboxStatus::Scheduled);

    assert_eq!(publisher.process_ready_events().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publisher.process_ready_events().await.unwrap(), 1);
}

#[tokio::test]
async fn cancel_and_cleanup() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let target = Arc::new(FlakyTarget::new(0));
    let publisher = OutboxPublisher::new(
        store.clone(),
        target,
        OutboxConfig {
            retention: Duration::from_millis(10),
            ..config()
        },
    );

    let cancelled = publisher.store_for_publishing(event()).await.unwrap();
    publisher.cancel_event(cancelled.id).await.unwrap();
    assert_eq!(
        store.get(cancelled.id).await.unwrap().unwrap().status,
        OutboxStatus::Cancelled
    );
    // terminal entries cannot be cancelled twice
    assert!(publisher.cancel_event(cancelled.id).await.is_err());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let removed = publisher.cleanup_old_events().await.unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(cancelled.id).await.unwrap().is_none());
}

#[tokio::test]
async fn background_worker_replays_until_shutdown() {
    let bus = EventBus::builder().build();
    let invocations = Arc::new(AtomicU32::new(0));

    let seen = invocations.clone();
    bus.subscribe(
        "ORDER_CREATED",
        "billing",
        SubscriptionOptions::default(),
        move |_event| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    )
    .unwrap();

    let store = Arc::new(InMemoryOutboxStore::new());
    let publisher = Arc::new(OutboxPublisher::new(
        store.clone(),
        Arc::new(LocalPublishTarget::new(bus.clone())),
        config(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let worker = publisher.clone();
    let running = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let entry = publisher.store_for_publishing(event()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.get(entry.id).await.unwrap().unwrap().status,
        OutboxStatus::Published
    );

    shutdown_tx.send(true).unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn outbox_can_target_the_bridge() {
    let transport = Arc::new(MemoryTransport::new());
    let bridge = Arc::new(KafkaBridge::new(transport.clone(), "events"));
    let store = Arc::new(InMemoryOutboxStore::new());
    let publisher = OutboxPublisher::new(store, bridge, config());

    let stored = publisher.store_for_publishing(event()).await.unwrap();
    publisher.process_ready_events().await.unwrap();

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "events.order-created");

    let envelope: EventEnvelope = serde_json::from_slice(&sent[0].2).unwrap();
    assert_eq!(envelope.event_id, stored.event.id);
}
