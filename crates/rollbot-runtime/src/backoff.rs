//! Jittered exponential backoff between connect attempts.
//!
//! The delay before retry `n` (1-based) is
//! `min(base * 2^(n-1), max) * U(1 - jitter, 1 + jitter)`.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_BASE: Duration = Duration::from_millis(400);
pub const DEFAULT_MAX: Duration = Duration::from_secs(2);
pub const DEFAULT_JITTER: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Fraction in `[0, 1)` applied symmetrically around the nominal delay.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max: DEFAULT_MAX,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl Backoff {
    /// Delay before retry `attempt` (1-based) without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exp).min(self.max)
    }

    /// Delay before retry `attempt` (1-based) with jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        self.nominal(attempt).mul_f64(factor)
    }

    /// Worst-case total sleep across `attempts` connect tries.
    pub fn worst_case(&self, attempts: u32) -> Duration {
        (1..attempts)
            .map(|n| self.nominal(n).mul_f64(1.0 + self.jitter))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn nominal_doubles_then_caps() {
        let b = Backoff::default();
        let ms: Vec<u128> = (1..=5).map(|n| b.nominal(n).as_millis()).collect();
        assert_eq!(ms, vec![400, 800, 1600, 2000, 2000]);
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(Backoff::default().nominal(u32::MAX), DEFAULT_MAX);
    }

    #[test]
    fn zero_jitter_is_exact() {
        let b = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(b.delay(2), Duration::from_millis(800));
    }

    #[test]
    fn worst_case_sums_retries_only() {
        let b = Backoff {
            jitter: 0.0,
            ..Backoff::default()
        };
        assert_eq!(b.worst_case(1), Duration::ZERO);
        assert_eq!(b.worst_case(3), Duration::from_millis(1200));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_band(attempt in 1u32..10) {
            let b = Backoff::default();
            let nominal = b.nominal(attempt).as_secs_f64();
            let d = b.delay(attempt).as_secs_f64();
            prop_assert!(d >= nominal * 0.8 - 1e-9);
            prop_assert!(d <= nominal * 1.2 + 1e-9);
        }
    }
}
