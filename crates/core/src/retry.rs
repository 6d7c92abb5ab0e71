//! Retry policy: pure decision from attempt history to next action.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::execution::{FailureCode, FailureReason};
use crate::id::JobId;

/// What to do after a failed attempt. Not persisted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    RetryImmediately,
    RetryAfter(Duration),
    GiveUp,
}

impl RetryDecision {
    /// Delay before the next attempt, if any.
    pub fn delay(self) -> Option<Duration> {
        match self {
            RetryDecision::RetryImmediately => Some(Duration::ZERO),
            RetryDecision::RetryAfter(d) => Some(d),
            RetryDecision::GiveUp => None,
        }
    }
}

/// Exponential backoff with a cap and multiplicative jitter.
///
/// `backoff(n) = min(base * multiplier^(n-1), cap)`; the jittered delay is
/// `backoff(n) * (1 - jitter * u)` with `u` drawn from `[0, 1)`, so it always
/// stays within `[0, cap]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    base_delay: Duration,
    multiplier: f64,
    cap: Duration,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            cap: Duration::from_secs(300),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, cap: Duration, jitter: f64) -> DomainResult<Self> {
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(DomainError::validation("backoff multiplier must be >= 1"));
        }
        if !(0.0..=1.0).contains(&jitter) {
            return Err(DomainError::validation("jitter must be within [0, 1]"));
        }
        if base_delay > cap {
            return Err(DomainError::validation("base delay must not exceed the backoff cap"));
        }
        Ok(Self {
            base_delay,
            multiplier,
            cap,
            jitter,
        })
    }

    /// Policy without delays, for tests and tight loops.
    pub fn immediate() -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            cap: Duration::ZERO,
            jitter: 0.0,
        }
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Un-jittered delay after the given 1-based attempt. Non-decreasing in `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(1023) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.cap.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay after `attempt` with jitter drawn from `rng`.
    pub fn jittered<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter == 0.0 || backoff.is_zero() {
            return backoff;
        }
        let u: f64 = rng.gen_range(0.0..1.0);
        backoff.mul_f64(1.0 - self.jitter * u).min(self.cap)
    }

    /// Decide what follows a failed `attempt` of a job allowing `max_retries` retries.
    pub fn decide<R: Rng + ?Sized>(
        &self,
        attempt: u32,
        max_retries: u32,
        failure: &FailureReason,
        rng: &mut R,
    ) -> RetryDecision {
        if !failure.is_retriable() || attempt > max_retries {
            return RetryDecision::GiveUp;
        }
        if failure.code == FailureCode::Interrupted {
            return RetryDecision::RetryImmediately;
        }
        match self.jittered(attempt, rng) {
            d if d.is_zero() => RetryDecision::RetryImmediately,
            d => RetryDecision::RetryAfter(d),
        }
    }
}

/// Seed for reproducible jitter.
///
/// Each (job, attempt) pair gets its own RNG stream, so a delay recomputed
/// from execution history after a restart equals the one first scheduled.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JitterSeed(pub u64);

impl JitterSeed {
    pub fn rng_for(self, job_id: JobId, attempt: u32) -> StdRng {
        let mixed = self.0
            ^ job_id.fold_u64()
            ^ u64::from(attempt).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        StdRng::seed_from_u64(mixed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::FailureClass;
    use proptest::prelude::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            0.5,
        )
        .unwrap()
    }

    fn transient() -> FailureReason {
        FailureReason::new(FailureCode::Application, "connection reset")
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let p = RetryPolicy::new(Duration::from_millis(100), 2.0, Duration::from_secs(10), 0.0)
            .unwrap();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(20), Duration::from_secs(10));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn gives_up_past_the_budget() {
        let p = policy();
        let mut rng = JitterSeed(7).rng_for(JobId::new(), 1);
        assert!(matches!(p.decide(1, 2, &transient(), &mut rng), RetryDecision::RetryAfter(_)));
        assert!(matches!(p.decide(2, 2, &transient(), &mut rng), RetryDecision::RetryAfter(_)));
        assert_eq!(p.decide(3, 2, &transient(), &mut rng), RetryDecision::GiveUp);
        assert_eq!(p.decide(1, 0, &transient(), &mut rng), RetryDecision::GiveUp);
    }

    #[test]
    fn non_retriable_failures_give_up_immediately() {
        let p = policy();
        let mut rng = JitterSeed(7).rng_for(JobId::new(), 1);
        let bad_input = FailureReason::new(FailureCode::Application, "schema mismatch")
            .with_class(FailureClass::NonRetriable);
        assert_eq!(p.decide(1, 10, &bad_input, &mut rng), RetryDecision::GiveUp);

        let unknown = FailureReason::new(FailureCode::UnknownTask, "no such task");
        assert_eq!(p.decide(1, 10, &unknown, &mut rng), RetryDecision::GiveUp);
    }

    #[test]
    fn interrupted_attempts_retry_immediately() {
        let p = policy();
        let mut rng = JitterSeed(7).rng_for(JobId::new(), 1);
        let interrupted = FailureReason::new(FailureCode::Interrupted, "orchestrator restarted");
        assert_eq!(p.decide(1, 3, &interrupted, &mut rng), RetryDecision::RetryImmediately);
    }

    #[test]
    fn zero_delay_policy_retries_immediately() {
        let p = RetryPolicy::immediate();
        let mut rng = JitterSeed(1).rng_for(JobId::new(), 1);
        assert_eq!(p.decide(1, 1, &transient(), &mut rng), RetryDecision::RetryImmediately);
    }

    #[test]
    fn invalid_policies_are_rejected() {
        assert!(RetryPolicy::new(Duration::from_secs(1), 0.5, Duration::from_secs(2), 0.0).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(2), 1.5).is_err());
        assert!(RetryPolicy::new(Duration::from_secs(5), 2.0, Duration::from_secs(2), 0.1).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: backoff never decreases as attempts grow, and never passes the cap.
        #[test]
        fn backoff_is_monotonic_up_to_cap(
            base_ms in 0u64..5_000,
            extra_cap_ms in 0u64..600_000,
            multiplier in 1.0f64..4.0,
            attempts in 1u32..64,
        ) {
            let cap = Duration::from_millis(base_ms + extra_cap_ms);
            let p = RetryPolicy::new(Duration::from_millis(base_ms), multiplier, cap, 0.0).unwrap();
            let mut last = Duration::ZERO;
            for n in 1..=attempts {
                let d = p.backoff(n);
                prop_assert!(d >= last);
                prop_assert!(d <= cap);
                last = d;
            }
        }

        /// Property: jitter keeps the delay in [0, cap] and is reproducible per seed.
        #[test]
        fn jitter_is_bounded_and_seeded(
            seed in any::<u64>(),
            attempt in 1u32..40,
            jitter in 0.0f64..=1.0,
        ) {
            let p = RetryPolicy::new(
                Duration::from_millis(50),
                2.0,
                Duration::from_secs(30),
                jitter,
            ).unwrap();
            let job = JobId::new();
            let a = p.jittered(attempt, &mut JitterSeed(seed).rng_for(job, attempt));
            let b = p.jittered(attempt, &mut JitterSeed(seed).rng_for(job, attempt));
            prop_assert_eq!(a, b);
            prop_assert!(a <= p.cap());
            prop_assert!(a <= p.backoff(attempt));
        }
    }
}
