/*!
# Rate Limit Module

Throttling primitives consulted before consuming jobs.

The module includes:
- The `RateLimiter` trait
- `TimeWindowLimiter`, a sliding window over recent consumption instants
- `CompositeLimiter`, enforcing the most restrictive of several limiters
- `NullRateLimiter`, never reached
- Parsing of rate specs such as `"10/min"` or `"100/2hours"`

Limiters measure time with `tokio::time::Instant`, so they follow a paused test clock.
*/

use crate::error::Result;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

mod composite;
mod parser;
mod window;

pub use composite::CompositeLimiter;
pub use parser::parse_rate_limit;
pub use window::TimeWindowLimiter;

/// Throttle shared by a queue backend or a worker
#[async_trait]
pub trait RateLimiter: Debug + Send + Sync {
    /// Time to wait before the limit stops being reached; zero when not reached
    fn wait_time(&self) -> Duration;

    /// Record one consumption; fails with `RateLimitReached` once the limit is exceeded
    fn pop(&self) -> Result<()>;

    fn reached(&self) -> bool;

    /// Wait time in microseconds
    fn wait_time_micros(&self) -> u64 {
        u64::try_from(self.wait_time().as_micros()).unwrap_or(u64::MAX)
    }

    /// Suspend the caller for `wait_time()`
    async fn wait(&self) {
        let wait = self.wait_time();
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait only if the limit is reached, then record a consumption
    async fn wait_and_pop(&self) -> Result<()> {
        if self.reached() {
            self.wait().await;
        }
        self.pop()
    }
}

/// Limiter that never throttles
#[derive(Debug, Clone, Copy, Default)]
pub struct NullRateLimiter;

impl RateLimiter for NullRateLimiter {
    fn wait_time(&self) -> Duration {
        Duration::ZERO
    }

    fn pop(&self) -> Result<()> {
        Ok(())
    }

    fn reached(&self) -> bool {
        false
    }
}

/// Shared unthrottled limiter
pub fn null_limiter() -> Arc<dyn RateLimiter> {
    Arc::new(NullRateLimiter)
}

/// Build a limiter from rate specs; each spec may hold several comma separated rates.
///
/// No spec gives a `NullRateLimiter`, a single rate a `TimeWindowLimiter`,
/// several rates a `CompositeLimiter`.
pub fn limiter_from_specs<I, S>(specs: I) -> Result<Arc<dyn RateLimiter>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut limiters = Vec::new();
    for spec in specs {
        for rate in spec.as_ref().split(',') {
            if rate.trim().is_empty() {
                continue;
            }
            limiters.push(Arc::new(rate.parse::<TimeWindowLimiter>()?) as Arc<dyn RateLimiter>);
        }
    }

    Ok(match limiters.len() {
        0 => null_limiter(),
        1 => limiters.remove(0),
        _ => Arc::new(CompositeLimiter::new(limiters)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_limiter_never_reached() {
        let limiter = NullRateLimiter;
        for _ in 0..1000 {
            limiter.pop().unwrap();
        }
        assert!(!limiter.reached());
        assert_eq!(limiter.wait_time_micros(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn specs_build_the_matching_limiter() {
        let none = limiter_from_specs(Vec::<String>::new()).unwrap();
        assert!(!none.reached());

        let single = limiter_from_specs(["2/s"]).unwrap();
        single.pop().unwrap();
        single.pop().unwrap();
        assert!(single.reached());

        let several = limiter_from_specs(["5/s, 1/min"]).unwrap();
        several.pop().unwrap();
        assert!(several.reached());
        assert!(several.wait_time() > Duration::from_secs(59));

        assert!(limiter_from_specs(["5/fortnight"]).is_err());
    }
}
