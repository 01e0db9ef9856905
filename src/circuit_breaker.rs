//! Circuit breaker for subscriber delivery
//!
//! Implements a three-state circuit breaker (Closed/Open/HalfOpen) per
//! subscriber id to isolate failing consumers and prevent cascading
//! failures across a dispatch round.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure count that trips the breaker
    pub failure_threshold: u32,
    /// Minimum calls observed before the breaker may trip
    pub minimum_calls: u32,
    /// Duration the circuit stays open before trying half-open
    pub open_cooldown: Duration,
    /// Trial calls permitted in half-open; all must succeed to close
    pub half_open_max_calls: u32,
    /// A successful call slower than this still counts as a failure
    pub slow_call_threshold: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            minimum_calls: 5,
            open_cooldown: Duration::from_secs(30),
            half_open_max_calls: 2,
            slow_call_threshold: Duration::from_secs(60),
        }
    }
}

/// Called on every state transition with (subscriber, from, to)
pub type TransitionObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Per-subscriber breaker state
struct BreakerState {
    state: AtomicU8,
    failures: AtomicU32,
    calls: AtomicU32,
    half_open_permits: AtomicU32,
    half_open_successes: AtomicU32,
    opened_at: AtomicU64, // epoch millis, meaningful while state != Closed
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.as_u8()),
            failures: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            half_open_permits: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
        }
    }
}

/// Registry of circuit breakers keyed by subscriber id
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<BreakerState>>>,
    config: CircuitBreakerConfig,
    observer: Option<TransitionObserver>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn get_or_create(&self, subscriber: &str) -> Arc<BreakerState> {
        self.breakers
            .entry(subscriber.to_string())
            .or_insert_with(|| Arc::new(BreakerState::new()))
            .clone()
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn transition(&self, subscriber: &str, breaker: &BreakerState, from: CircuitState, to: CircuitState) {
        breaker.state.store(to.as_u8(), Ordering::Relaxed);
        match to {
            CircuitState::Open => {
                breaker.opened_at.store(Self::now_millis(), Ordering::Relaxed);
                breaker.half_open_permits.store(0, Ordering::Relaxed);
                breaker.half_open_successes.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                breaker.half_open_permits.store(0, Ordering::Relaxed);
                breaker.half_open_successes.store(0, Ordering::Relaxed);
            }
            CircuitState::Closed => {
                breaker.failures.store(0, Ordering::Relaxed);
                breaker.calls.store(0, Ordering::Relaxed);
                breaker.half_open_permits.store(0, Ordering::Relaxed);
                breaker.half_open_successes.store(0, Ordering::Relaxed);
            }
        }

        tracing::info!(
            subscriber = subscriber,
            from = from.as_str(),
            to = to.as_str(),
            "Circuit breaker transition"
        );

        if let Some(observer) = &self.observer {
            observer(subscriber, from, to);
        }
    }

    /// Get the current state of the circuit for a subscriber
    pub fn state(&self, subscriber: &str) -> CircuitState {
        let breaker = self.get_or_create(subscriber);
        CircuitState::from_u8(breaker.state.load(Ordering::Relaxed))
    }

    /// Check whether a delivery attempt may be made
    ///
    /// Drives the Open -> HalfOpen transition once the cooldown has elapsed
    /// and rations trial permits while half-open.
    pub fn allow_request(&self, subscriber: &str) -> bool {
        let breaker = self.get_or_create(subscriber);

        match CircuitState::from_u8(breaker.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened = breaker.opened_at.load(Ordering::Relaxed);
                let elapsed = Self::now_millis().saturating_sub(opened);
                if elapsed < self.config.open_cooldown.as_millis() as u64 {
                    return false;
                }
                // Cooldown elapsed: exactly one caller moves it to half-open
                if breaker
                    .state
                    .compare_exchange(
                        CircuitState::Open.as_u8(),
                        CircuitState::HalfOpen.as_u8(),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    self.transition(subscriber, &breaker, CircuitState::Open, CircuitState::HalfOpen);
                }
                let permits = breaker.half_open_permits.fetch_add(1, Ordering::Relaxed);
                permits < self.config.half_open_max_calls
            }
            CircuitState::HalfOpen => {
                let permits = breaker.half_open_permits.fetch_add(1, Ordering::Relaxed);
                permits < self.config.half_open_max_calls
            }
        }
    }

    /// Record the outcome of a successful delivery attempt
    ///
    /// Slow calls count as failures even though the handler succeeded.
    pub fn record_success(&self, subscriber: &str, elapsed: Duration) {
        if elapsed >= self.config.slow_call_threshold {
            tracing::warn!(
                subscriber = subscriber,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow call counted as failure"
            );
            self.record_failure(subscriber);
            return;
        }

        let breaker = self.get_or_create(subscriber);
        match CircuitState::from_u8(breaker.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => {
                breaker.calls.fetch_add(1, Ordering::Relaxed);
                // Success decays the failure count toward zero
                let _ = breaker
                    .failures
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |f| {
                        Some(f.saturating_sub(1))
                    });
            }
            CircuitState::HalfOpen => {
                let successes = breaker.half_open_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.half_open_max_calls {
                    self.transition(subscriber, &breaker, CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed delivery attempt
    pub fn record_failure(&self, subscriber: &str) {
        let breaker = self.get_or_create(subscriber);
        match CircuitState::from_u8(breaker.state.load(Ordering::Relaxed)) {
            CircuitState::Closed => {
                let calls = breaker.calls.fetch_add(1, Ordering::Relaxed) + 1;
                let failures = breaker.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.config.failure_threshold && calls >= self.config.minimum_calls {
                    self.transition(subscriber, &breaker, CircuitState::Closed, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // Any half-open failure re-opens the circuit
                self.transition(subscriber, &breaker, CircuitState::HalfOpen, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Snapshot for monitoring: (state, failures, calls)
    pub fn metrics(&self, subscriber: &str) -> (CircuitState, u32, u32) {
        let breaker = self.get_or_create(subscriber);
        (
            CircuitState::from_u8(breaker.state.load(Ordering::Relaxed)),
            breaker.failures.load(Ordering::Relaxed),
            breaker.calls.load(Ordering::Relaxed),
        )
    }
}
