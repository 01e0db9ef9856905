//! Metrics sink
//!
//! Counters and timers for bus activity. The sink is injected; the default
//! implementations are a no-op sink and a Prometheus-backed sink with an
//! owned registry.

use std::time::Duration;

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitState;
use crate::error::ErrorKind;

const FAILURE_KINDS: &[ErrorKind] = &[
    ErrorKind::Validation,
    ErrorKind::Timeout,
    ErrorKind::ConsumerFailure,
    ErrorKind::NonRetryable,
    ErrorKind::Poison,
    ErrorKind::CircuitRejected,
    ErrorKind::RetryExhausted,
    ErrorKind::QueueOverflow,
    ErrorKind::TransportFailure,
];

/// Observations the dispatch engine publishes
pub trait MetricsSink: Send + Sync {
    fn record_published(&self);
    fn record_processed(&self, latency: Duration);
    fn record_failed(&self, kind: ErrorKind, latency: Duration);
    fn record_dead_letter(&self, reason: ErrorKind);
    fn record_retry(&self, attempt: u32);
    fn record_timeout(&self);
    fn record_circuit_transition(&self, subscriber: &str, from: CircuitState, to: CircuitState);

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
}

/// Point-in-time counter values, serializable for the JSON export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub processed: u64,
    pub failed: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub dead_lettered: u64,
    pub success_rate: f64,
    pub avg_processing_ms: f64,
}

/// Sink that drops every observation
#[derive(Debug, Clone, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_published(&self) {}
    fn record_processed(&self, _latency: Duration) {}
    fn record_failed(&self, _kind: ErrorKind, _latency: Duration) {}
    fn record_dead_letter(&self, _reason: ErrorKind) {}
    fn record_retry(&self, _attempt: u32) {}
    fn record_timeout(&self) {}
    fn record_circuit_transition(&self, _subscriber: &str, _from: CircuitState, _to: CircuitState) {
    }
}

/// Prometheus-backed sink
///
/// Owns its registry so that multiple buses in one process do not collide
/// on the global default registry.
pub struct PrometheusMetrics {
    registry: Registry,
    published: IntCounter,
    processed: IntCounter,
    failed: IntCounterVec,
    retries: IntCounter,
    timeouts: IntCounter,
    dead_letters: IntCounterVec,
    circuit_transitions: IntCounterVec,
    success_rate: Gauge,
    processing_time: Histogram,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let published = IntCounter::with_opts(Opts::new(
            "eventbus_events_published_total",
            "Total number of events accepted by publish",
        ))
        .expect("valid metric opts for eventbus_events_published_total");

        let processed = IntCounter::with_opts(Opts::new(
            "eventbus_events_processed_total",
            "Total number of successful deliveries",
        ))
        .expect("valid metric opts for eventbus_events_processed_total");

        let failed = IntCounterVec::new(
            Opts::new(
                "eventbus_events_failed_total",
                "Total number of failed delivery attempts by error kind",
            ),
            &["kind"],
        )
        .expect("valid metric opts for eventbus_events_failed_total");

        let retries = IntCounter::with_opts(Opts::new(
            "eventbus_retry_attempts_total",
            "Total number of scheduled retry attempts",
        ))
        .expect("valid metric opts for eventbus_retry_attempts_total");

        let timeouts = IntCounter::with_opts(Opts::new(
            "eventbus_timeouts_total",
            "Total number of delivery attempts cancelled by timeout",
        ))
        .expect("valid metric opts for eventbus_timeouts_total");

        let dead_letters = IntCounterVec::new(
            Opts::new(
                "eventbus_dead_letters_total",
                "Total number of events routed to the dead-letter queue by reason",
            ),
            &["reason"],
        )
        .expect("valid metric opts for eventbus_dead_letters_total");

        let circuit_transitions = IntCounterVec::new(
            Opts::new(
                "eventbus_circuit_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["from", "to"],
        )
        .expect("valid metric opts for eventbus_circuit_transitions_total");

        let success_rate = Gauge::with_opts(Opts::new(
            "eventbus_success_rate",
            "Fraction of deliveries that succeeded",
        ))
        .expect("valid metric opts for eventbus_success_rate");

        let processing_time = Histogram::with_opts(
            HistogramOpts::new(
                "eventbus_processing_time_ms",
                "Delivery attempt duration in milliseconds",
            )
            .buckets(vec![
                1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
            ]),
        )
        .expect("valid metric opts for eventbus_processing_time_ms");

        // materialize one child per kind so the families render even before
        // the first failure
        for kind in FAILURE_KINDS {
            failed.with_label_values(&[kind.as_str()]);
            dead_letters.with_label_values(&[kind.as_str()]);
        }

        for metric in [
            Box::new(published.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(processed.clone()),
            Box::new(failed.clone()),
            Box::new(retries.clone()),
            Box::new(timeouts.clone()),
            Box::new(dead_letters.clone()),
            Box::new(circuit_transitions.clone()),
            Box::new(success_rate.clone()),
            Box::new(processing_time.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                tracing::warn!("Failed to register eventbus metric: {}", e);
            }
        }

        Self {
            registry,
            published,
            processed,
            failed,
            retries,
            timeouts,
            dead_letters,
            circuit_transitions,
            success_rate,
            processing_time,
        }
    }

    fn failed_total(&self) -> u64 {
        FAILURE_KINDS
            .iter()
            .map(|kind| self.failed.with_label_values(&[kind.as_str()]).get())
            .sum()
    }

    fn refresh_success_rate(&self) -> f64 {
        let processed = self.processed.get() as f64;
        let failed = self.failed_total() as f64;
        let total = processed + failed;
        let rate = if total > 0.0 { processed / total } else { 1.0 };
        self.success_rate.set(rate);
        rate
    }

    /// Render the Prometheus exposition format
    pub fn render(&self) -> String {
        self.refresh_success_rate();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Snapshot as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_default()
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_published(&self) {
        self.published.inc();
    }

    fn record_processed(&self, latency: Duration) {
        self.processed.inc();
        self.processing_time.observe(latency.as_secs_f64() * 1000.0);
    }

    fn record_failed(&self, kind: ErrorKind, latency: Duration) {
        self.failed.with_label_values(&[kind.as_str()]).inc();
        self.processing_time.observe(latency.as_secs_f64() * 1000.0);
    }

    fn record_dead_letter(&self, reason: ErrorKind) {
        self.dead_letters
            .with_label_values(&[reason.as_str()])
            .inc();
    }

    fn record_retry(&self, _attempt: u32) {
        self.retries.inc();
    }

    fn record_timeout(&self) {
        self.timeouts.inc();
    }

    fn record_circuit_transition(&self, _subscriber: &str, from: CircuitState, to: CircuitState) {
        self.circuit_transitions
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let processed = self.processed.get();
        let failed = self.failed_total();
        let count = self.processing_time.get_sample_count();
        let avg = if count > 0 {
            self.processing_time.get_sample_sum() / count as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            published: self.published.get(),
            processed,
            failed,
            retries: self.retries.get(),
            timeouts: self.timeouts.get(),
            dead_lettered: FAILURE_KINDS
                .iter()
                .map(|kind| self.dead_letters.with_label_values(&[kind.as_str()]).get())
                .sum(),
            success_rate: self.refresh_success_rate(),
            avg_processing_ms: avg,
        }
    }
}
