//! Sliding-window limiter.

use super::{parse_rate_limit, RateLimiter};
use crate::error::{Result, StevedoreError};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Allows `limit` consumptions within any window of `step`
#[derive(Debug)]
pub struct TimeWindowLimiter {
    limit: usize,
    step: Duration,
    // min-heap of consumption instants
    events: Mutex<BinaryHeap<Reverse<Instant>>>,
}

impl TimeWindowLimiter {
    pub fn new(limit: usize, step: Duration) -> Self {
        Self {
            limit,
            step,
            events: Mutex::new(BinaryHeap::new()),
        }
    }

    /// `limit` consumptions per `step_secs` seconds
    pub fn per_seconds(limit: usize, step_secs: u64) -> Self {
        Self::new(limit, Duration::from_secs(step_secs))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn step(&self) -> Duration {
        self.step
    }

    /// Drop instants that left the window, returning the rest
    fn clean(&self) -> std::sync::MutexGuard<'_, BinaryHeap<Reverse<Instant>>> {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        while let Some(Reverse(oldest)) = events.peek() {
            if now.saturating_duration_since(*oldest) > self.step {
                events.pop();
            } else {
                break;
            }
        }

        events
    }
}

impl RateLimiter for TimeWindowLimiter {
    fn wait_time(&self) -> Duration {
        let events = self.clean();
        if events.len() < self.limit {
            return Duration::ZERO;
        }

        match events.peek() {
            Some(Reverse(oldest)) => self
                .step
                .saturating_sub(Instant::now().saturating_duration_since(*oldest)),
            None => Duration::ZERO,
        }
    }

    fn pop(&self) -> Result<()> {
        let mut events = self.clean();
        if events.len() > self.limit {
            return Err(StevedoreError::RateLimitReached);
        }

        events.push(Reverse(Instant::now()));
        Ok(())
    }

    fn reached(&self) -> bool {
        self.clean().len() >= self.limit
    }
}

impl FromStr for TimeWindowLimiter {
    type Err = StevedoreError;

    fn from_str(spec: &str) -> Result<Self> {
        let (limit, step_secs) = parse_rate_limit(spec)?;
        Ok(Self::per_seconds(limit, step_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn permits_limit_pops_per_window() {
        let limiter = TimeWindowLimiter::per_seconds(3, 10);

        for _ in 0..3 {
            assert!(!limiter.reached());
            assert_eq!(limiter.wait_time(), Duration::ZERO);
            limiter.pop().unwrap();
        }

        assert!(limiter.reached());
        assert_eq!(limiter.wait_time(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(limiter.wait_time(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = TimeWindowLimiter::per_seconds(2, 5);
        limiter.pop().unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.pop().unwrap();
        assert!(limiter.reached());

        // first instant leaves the window only once strictly older than the step
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.reached());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!limiter.reached());
    }

    #[tokio::test(start_paused = true)]
    async fn pop_fails_once_limit_exceeded() {
        let limiter = TimeWindowLimiter::per_seconds(1, 60);
        limiter.pop().unwrap();
        limiter.pop().unwrap();

        assert!(matches!(
            limiter.pop(),
            Err(StevedoreError::RateLimitReached)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_and_pop_sleeps_until_window_frees() {
        let limiter = TimeWindowLimiter::per_seconds(1, 2);
        let start = Instant::now();

        limiter.wait_and_pop().await.unwrap();
        limiter.wait_and_pop().await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[test]
    fn parses_from_spec() {
        let limiter: TimeWindowLimiter = "30/5min".parse().unwrap();
        assert_eq!(limiter.limit(), 30);
        assert_eq!(limiter.step(), Duration::from_secs(300));
    }
}
