//! Retry and circuit-breaker configuration shared by jobs, workflow steps,
//! the event scheduler's source admission control, and the auto-materializer's
//! failure backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter applied to a computed backoff delay.
///
/// `Full` resamples uniformly in `[0, delay]`; `Equal` samples uniformly in
/// `[delay/2, delay]`, keeping half the computed delay as a floor. Matches
/// the vocabulary spec §4.C uses verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    None,
    Full,
    Equal,
}

impl Default for Jitter {
    fn default() -> Self {
        Jitter::None
    }
}

/// Backoff strategy for a retry policy, per spec §4.C step 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No retry is attempted.
    None,
    /// `initialDelayMs` clamped by `maxDelayMs`.
    Fixed,
    /// `initialDelayMs * 2^(attempt-1)` clamped by `maxDelayMs`.
    Exponential,
}

/// Configuration for job/step retries.
///
/// # Example
///
/// ```
/// use dockyard_types::reliability::{RetryPolicy, BackoffStrategy, Jitter};
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_delay(Duration::from_millis(10))
///     .with_max_delay(Duration::from_secs(60))
///     .with_jitter(Jitter::Full);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: Jitter::None,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            jitter: Jitter::None,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            strategy: BackoffStrategy::None,
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Jitter::None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether attempt `attempt` (1-based, the attempt that just failed) may
    /// be retried.
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        !matches!(self.strategy, BackoffStrategy::None) && attempt < self.max_attempts
    }

    /// Compute the unjittered, clamped base delay before applying jitter.
    fn base_delay(&self, attempt: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed => self.initial_delay.min(self.max_delay),
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1);
                let secs = self.initial_delay.as_secs_f64() * 2f64.powi(exp as i32);
                let capped = secs.min(self.max_delay.as_secs_f64());
                Duration::from_secs_f64(capped.max(0.0))
            }
        }
    }

    /// Delay to wait before retrying `attempt` (the attempt number about to
    /// be made, 1-based). Satisfies P6: for `Exponential` + `Full` jitter the
    /// result lies in `[0, clamp(initial*2^(attempt-1), max)]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        match self.jitter {
            Jitter::None => base,
            Jitter::Full => {
                let mut rng = rand::thread_rng();
                let secs = rng.gen_range(0.0..=base.as_secs_f64().max(0.0001));
                Duration::from_secs_f64(secs)
            }
            Jitter::Equal => {
                let mut rng = rand::thread_rng();
                let half = base.as_secs_f64() / 2.0;
                let secs = half + rng.gen_range(0.0..=half.max(0.0001));
                Duration::from_secs_f64(secs)
            }
        }
    }
}

/// Circuit breaker states, used by the event scheduler for per-source
/// admission control (spec §4.E) and available for any other component that
/// needs the same three-state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.strategy, BackoffStrategy::Exponential);
    }

    #[test]
    fn no_retry_has_no_attempts_remaining() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn exponential_delay_sequence_without_jitter() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_secs(60));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(40));
    }

    #[test]
    fn exponential_delay_is_clamped() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(25));

        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(25));
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(Jitter::Full);

        for attempt in 1..=6 {
            let base = policy.base_delay(attempt);
            for _ in 0..20 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(delay <= base, "delay {delay:?} exceeded base {base:?}");
            }
        }
    }

    #[test]
    fn equal_jitter_keeps_half_as_floor() {
        let policy = RetryPolicy::exponential()
            .with_initial_delay(Duration::from_millis(20))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(Jitter::Equal);

        let base = policy.base_delay(3);
        for _ in 0..20 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay.as_secs_f64() >= base.as_secs_f64() / 2.0 - 0.001);
            assert!(delay <= base);
        }
    }

    #[test]
    fn fixed_policy_is_constant() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn retry_policy_roundtrips_json() {
        let policy = RetryPolicy::exponential().with_max_attempts(10);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }

    #[test]
    fn circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }
}
