//! Limiter combining several limiters.

use super::RateLimiter;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Reached as soon as one inner limiter is reached; waits for the slowest one
#[derive(Debug, Clone)]
pub struct CompositeLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl CompositeLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }

    pub fn limiters(&self) -> &[Arc<dyn RateLimiter>] {
        &self.limiters
    }
}

impl RateLimiter for CompositeLimiter {
    fn wait_time(&self) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.wait_time())
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn pop(&self) -> Result<()> {
        for limiter in &self.limiters {
            limiter.pop()?;
        }
        Ok(())
    }

    fn reached(&self) -> bool {
        self.limiters.iter().any(|limiter| limiter.reached())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{NullRateLimiter, TimeWindowLimiter};

    #[tokio::test(start_paused = true)]
    async fn most_restrictive_limiter_wins() {
        let per_second = Arc::new(TimeWindowLimiter::per_seconds(2, 1));
        let per_minute = Arc::new(TimeWindowLimiter::per_seconds(3, 60));
        let limiters: Vec<Arc<dyn RateLimiter>> = vec![
            per_second.clone(),
            per_minute.clone(),
            Arc::new(NullRateLimiter),
        ];
        let composite = CompositeLimiter::new(limiters);

        composite.pop().unwrap();
        assert!(!composite.reached());

        composite.pop().unwrap();
        assert!(per_second.reached());
        assert!(!per_minute.reached());
        assert!(composite.reached());
        assert_eq!(composite.wait_time(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(1500)).await;
        composite.pop().unwrap();
        assert!(per_minute.reached());
        assert_eq!(
            composite.wait_time(),
            per_second.wait_time().max(per_minute.wait_time())
        );
        assert_eq!(composite.wait_time(), Duration::from_millis(58_500));
    }
}
