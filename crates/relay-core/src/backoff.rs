//! Backoff policy for retries.
//!
//! Pure and stateless: the delay before retry `n` depends only on `n` and the
//! policy. The initial attempt never waits; `attempt_index` 0 is the first
//! retry.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lower bound (inclusive) of the jitter factor.
pub const JITTER_MIN: f64 = 0.5;

/// Upper bound (exclusive) of the jitter factor.
pub const JITTER_MAX: f64 = 1.5;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `base * 2^attempt_index`, capped at `max_delay`
    Exponential,
    /// Always `base`
    Constant,
}

impl Default for BackoffKind {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Retry delay policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Growth strategy
    #[serde(default)]
    pub kind: BackoffKind,

    /// Base delay
    #[serde(with = "crate::duration::human")]
    pub base: Duration,

    /// Upper bound for exponential growth
    #[serde(with = "crate::duration::human")]
    pub max_delay: Duration,

    /// Multiply each delay by a random factor in `[0.5, 1.5)`
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Exponential policy with jitter.
    pub fn exponential(base: Duration, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base,
            max_delay,
            jitter: true,
        }
    }

    /// Constant policy with jitter.
    pub fn constant(base: Duration) -> Self {
        Self {
            kind: BackoffKind::Constant,
            base,
            max_delay: base,
            jitter: true,
        }
    }

    /// Disable jitter (deterministic delays).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry `attempt_index`, before jitter.
    pub fn base_delay(&self, attempt_index: u32) -> Duration {
        match self.kind {
            BackoffKind::Constant => self.base,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt_index);
                self.base.saturating_mul(factor).min(self.max_delay)
            }
        }
    }

    /// Delay before retry `attempt_index`, jittered when enabled.
    pub fn delay(&self, attempt_index: u32) -> Duration {
        self.delay_with(attempt_index, &mut rand::thread_rng())
    }

    /// Same as [`delay`](Self::delay) with a caller-supplied RNG.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt_index: u32, rng: &mut R) -> Duration {
        let delay = self.base_delay(attempt_index);
        if !self.jitter {
            return delay;
        }
        let factor = rng.gen_range(JITTER_MIN..JITTER_MAX);
        // Keep the unjittered delay when scaling would overflow
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
    }

    /// Iterator over the delays of the first `max_retries` retries.
    pub fn schedule(&self, max_retries: u32) -> Schedule {
        Schedule {
            policy: self.clone(),
            next: 0,
            remaining: max_retries,
        }
    }
}

/// Finite iterator of retry delays produced by [`BackoffPolicy::schedule`].
#[derive(Debug, Clone)]
pub struct Schedule {
    policy: BackoffPolicy,
    next: u32,
    remaining: u32,
}

impl Iterator for Schedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.policy.delay(self.next);
        self.next += 1;
        Some(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_exponential_doubles_until_cap() {
        let policy =
            BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5)).without_jitter();

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_ignores_attempt() {
        let policy = BackoffPolicy::constant(Duration::from_secs(1)).without_jitter();
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(7), Duration::from_secs(1));
    }

    #[test]
    fn test_schedule_length() {
        let policy = BackoffPolicy::default().without_jitter();
        let delays: Vec<_> = policy.schedule(3).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(2000)
            ]
        );
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: BackoffPolicy =
            serde_yaml::from_str("kind: constant\nbase: 1s\nmax_delay: 1s\n").unwrap();
        assert_eq!(policy.kind, BackoffKind::Constant);
        assert!(policy.jitter);
    }

    #[test]
    fn test_jitter_near_duration_max_does_not_overflow() {
        let policy = BackoffPolicy::constant(Duration::MAX);
        for _ in 0..200 {
            assert!(policy.delay(0) >= Duration::MAX / 2);
        }

        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::MAX);
        assert!(policy.delay(u32::MAX) > Duration::ZERO);
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_band(attempt in 0u32..64, base_ms in 1u64..10_000, cap_ms in 1u64..120_000) {
            let policy = BackoffPolicy::exponential(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let raw = policy.base_delay(attempt);
            let jittered = policy.delay(attempt);
            prop_assert!(raw <= Duration::from_millis(cap_ms.max(base_ms)));
            prop_assert!(jittered >= raw.mul_f64(JITTER_MIN));
            prop_assert!(jittered <= raw.mul_f64(JITTER_MAX));
        }
    }
}
