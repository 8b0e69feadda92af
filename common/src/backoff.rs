use rand::Rng;

use crate::config::RetryConfig;

/// Capped exponential backoff with additive jitter.
///
/// `base_delay_ms` never decreases with the attempt number and never exceeds
/// `max_ms`; `delay_ms` adds at most `jitter_ms` on top.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial_ms: u64,
    max_ms: u64,
    multiplier: f64,
    jitter_ms: u64,
}

impl Backoff {
    pub fn new(initial_ms: u64, max_ms: u64, multiplier: f32, jitter_ms: u64) -> Self {
        Self {
            initial_ms,
            max_ms: max_ms.max(initial_ms),
            multiplier: f64::from(multiplier.max(1.0)),
            jitter_ms,
        }
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    pub fn jitter_ms(&self) -> u64 {
        self.jitter_ms
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.initial_ms as f64 * self.multiplier.powi(exponent);
        if !delay.is_finite() || delay >= self.max_ms as f64 {
            self.max_ms
        } else {
            delay as u64
        }
    }

    pub fn delay_ms<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> u64 {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=self.jitter_ms)
        };
        self.base_delay_ms(attempt).saturating_add(jitter)
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_backoff_ms,
            config.max_backoff_ms,
            config.backoff_multiplier,
            config.jitter_ms,
        )
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;

    #[test]
    fn base_delay_doubles_until_cap() {
        let backoff = Backoff::new(1_000, 10_000, 2.0, 0);
        let delays: Vec<u64> = (1..=6).map(|n| backoff.base_delay_ms(n)).collect();

        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn base_delay_is_monotonic_and_capped() {
        let backoff = Backoff::from(&RetryConfig::default());
        let mut previous = 0;
        for attempt in 1..=200 {
            let delay = backoff.base_delay_ms(attempt);
            assert!(delay >= previous, "attempt {attempt}: {delay} < {previous}");
            assert!(delay <= backoff.max_ms());
            previous = delay;
        }
    }

    #[test]
    fn jittered_delay_stays_within_bound() {
        let backoff = Backoff::new(500, 30_000, 2.0, 750);
        let mut rng = StdRng::seed_from_u64(7);

        for attempt in 1..=40 {
            for _ in 0..50 {
                let delay = backoff.delay_ms(attempt, &mut rng);
                assert!(delay >= backoff.base_delay_ms(attempt));
                assert!(delay <= backoff.max_ms() + backoff.jitter_ms());
            }
        }
    }

    #[test]
    fn multiplier_below_one_is_treated_as_constant() {
        let backoff = Backoff::new(2_000, 8_000, 0.5, 0);
        assert_eq!(backoff.base_delay_ms(1), 2_000);
        assert_eq!(backoff.base_delay_ms(5), 2_000);
    }
}
