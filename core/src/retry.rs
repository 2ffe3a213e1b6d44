/*!
# Retry Module

Back-off applied by the worker when a handler fails and the job is released.

The delay grows geometrically with the number of attempts:
`base` on the first attempt, then `base × multiplier^(attempts − 1)`.
A multiplier below 1 is clamped to 1, which yields a constant delay.
An optional jitter factor spreads retries of jobs that failed together.
*/

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Back-off policy for failed jobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry, in seconds
    pub base_secs: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Random jitter factor (0.0 to 1.0)
    #[serde(default)]
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_secs: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl Backoff {
    pub fn new(base_secs: u64, multiplier: f64) -> Self {
        Self {
            base_secs,
            multiplier,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before a job that has been tried `attempts` times becomes eligible again
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let secs = self.delay_secs(attempts);

        if self.jitter > 0.0 && secs > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_factor = 1.0 - self.jitter + (rng.gen::<f64>() * self.jitter * 2.0);
            return Duration::from_secs_f64((secs * jitter_factor).max(0.0));
        }

        Duration::from_secs_f64(secs)
    }

    fn delay_secs(&self, attempts: u32) -> f64 {
        let base = self.base_secs as f64;
        if attempts <= 1 {
            return base;
        }

        let multiplier = self.multiplier.max(1.0);
        let exponent = i32::try_from(attempts - 1).unwrap_or(i32::MAX);
        let secs = base * multiplier.powi(exponent);

        // Saturate far below f64 overflow so Duration construction never panics
        secs.min(u32::MAX as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempts() {
        let backoff = Backoff::new(30, 2.0);

        let delays: Vec<u64> = (1..=4).map(|n| backoff.next_delay(n).as_secs()).collect();
        assert_eq!(delays, vec![30, 60, 120, 240]);
    }

    #[test]
    fn multiplier_below_one_is_constant() {
        let backoff = Backoff::new(30, 0.5);

        for attempts in 1..6 {
            assert_eq!(backoff.next_delay(attempts), Duration::from_secs(30));
        }
    }

    #[test]
    fn zero_attempts_uses_base() {
        assert_eq!(Backoff::new(7, 3.0).next_delay(0), Duration::from_secs(7));
    }

    #[test]
    fn huge_attempt_counts_saturate() {
        let backoff = Backoff::new(1, 10.0);
        assert_eq!(backoff.next_delay(500).as_secs(), u32::MAX as u64);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(100, 1.0).with_jitter(0.1);

        for _ in 0..200 {
            let secs = backoff.next_delay(3).as_secs_f64();
            assert!((90.0..=110.0).contains(&secs), "delay {} out of range", secs);
        }
    }

    #[test]
    fn default_is_immediate_retry() {
        assert_eq!(Backoff::default().next_delay(9), Duration::ZERO);
    }
}
