//! Retry policy
//!
//! Attempt accounting, exponential backoff with optional jitter, and the
//! retryability decision applied between delivery attempts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{classes, HandlerError};

/// Custom retryability decision, consulted after the class sets
pub type RetryPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total invocation budget per (event, subscription), including the first
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// ±25% multiplicative jitter on each delay when enabled
    pub jitter: bool,
    /// When non-empty, only these classes retry
    pub retryable_classes: HashSet<String>,
    /// These classes never retry; wins over everything else
    pub non_retryable_classes: HashSet<String>,
    pub predicate: Option<RetryPredicate>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_classes: HashSet::new(),
            non_retryable_classes: HashSet::new(),
            predicate: None,
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .field("retryable_classes", &self.retryable_classes)
            .field("non_retryable_classes", &self.non_retryable_classes)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = max;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn retry_only(mut self, classes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.retryable_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn never_retry(mut self, classes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.non_retryable_classes = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&HandlerError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Backoff before attempt `n + 1`, where `n` is the 1-based attempt that
    /// just failed: `min(max_delay, initial_delay * multiplier^(n-1))`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped * factor)
    }

    /// Decide whether a failed attempt should be retried
    ///
    /// Precedence: non-retryable set, then retryable set (when non-empty),
    /// then the custom predicate, then the default classification.
    pub fn should_retry(&self, error: &HandlerError) -> bool {
        if self.non_retryable_classes.contains(&error.class) {
            return false;
        }
        if !self.retryable_classes.is_empty() && !self.retryable_classes.contains(&error.class) {
            return false;
        }
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        default_retryable(error)
    }
}

/// Default classification: argument/state misuse is not going to heal with
/// another attempt, everything else is treated as transient.
fn default_retryable(error: &HandlerError) -> bool {
    !matches!(
        error.class.as_str(),
        classes::INVALID_ARGUMENT | classes::INVALID_STATE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(100), Duration::from_millis(500))
            .with_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(4), Duration::from_millis(500));
        assert_eq!(policy.delay_for(10), Duration::from_millis(500));
    }

    #[test]
    fn backoff_is_monotonic() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(10), Duration::from_secs(1))
            .with_multiplier(1.7)
            .with_jitter(false);

        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= last, "delay({attempt}) regressed");
            last = delay;
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(100), Duration::from_secs(10))
            .with_multiplier(1.0)
            .with_jitter(true);

        for _ in 0..100 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(75));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn non_retryable_set_wins() {
        let policy = RetryPolicy::default()
            .never_retry(["transient"])
            .with_predicate(|_| true);

        assert!(!policy.should_retry(&HandlerError::transient("boom")));
        assert!(policy.should_retry(&HandlerError::new("other", "boom")));
    }

    #[test]
    fn retryable_set_excludes_everything_else() {
        let policy = RetryPolicy::default().retry_only(["transient"]);

        assert!(policy.should_retry(&HandlerError::transient("boom")));
        assert!(!policy.should_retry(&HandlerError::new("other", "boom")));
    }

    #[test]
    fn default_classification() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(&HandlerError::transient("boom")));
        assert!(policy.should_retry(&HandlerError::timeout(Duration::from_secs(1))));
        assert!(!policy.should_retry(&HandlerError::invalid_argument("bad input")));
        assert!(!policy.should_retry(&HandlerError::invalid_state("not ready")));
    }
}
