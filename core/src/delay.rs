//! Delay before a pushed or released job becomes eligible for consumption.

use chrono::{DateTime, Duration, Utc};

/// How long a job stays invisible after push/release.
///
/// Negative durations and instants in the past mean "available immediately".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Relative delay in whole seconds
    Seconds(i64),
    /// Relative delay as an interval
    Interval(Duration),
    /// Absolute instant
    At(DateTime<Utc>),
}

impl Delay {
    /// No delay at all
    pub const fn none() -> Self {
        Self::Seconds(0)
    }

    /// Instant at which the job becomes available, never earlier than `now`
    pub fn available_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let at = match *self {
            Self::Seconds(secs) if secs <= 0 => return now,
            Self::Seconds(secs) => {
                Duration::try_seconds(secs).and_then(|interval| now.checked_add_signed(interval))
            }
            Self::Interval(interval) if interval <= Duration::zero() => return now,
            Self::Interval(interval) => now.checked_add_signed(interval),
            Self::At(at) => Some(at),
        };

        at.unwrap_or(DateTime::<Utc>::MAX_UTC).max(now)
    }

    /// Remaining delay in seconds relative to `now`, rounded up, never negative
    pub fn seconds_from(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.available_at(now) - now).num_milliseconds();
        ((millis + 999) / 1000).max(0) as u64
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::none()
    }
}

impl From<i64> for Delay {
    fn from(secs: i64) -> Self {
        Self::Seconds(secs)
    }
}

impl From<i32> for Delay {
    fn from(secs: i32) -> Self {
        Self::Seconds(secs as i64)
    }
}

impl From<u32> for Delay {
    fn from(secs: u32) -> Self {
        Self::Seconds(secs as i64)
    }
}

impl From<u64> for Delay {
    fn from(secs: u64) -> Self {
        Self::Seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for Delay {
    fn from(interval: Duration) -> Self {
        Self::Interval(interval)
    }
}

impl From<std::time::Duration> for Delay {
    fn from(interval: std::time::Duration) -> Self {
        Self::Interval(Duration::from_std(interval).unwrap_or_else(|_| Duration::weeks(52 * 100)))
    }
}

impl From<DateTime<Utc>> for Delay {
    fn from(at: DateTime<Utc>) -> Self {
        Self::At(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn past_and_negative_delays_normalize_to_now() {
        let now = Utc::now();

        assert_eq!(Delay::from(-10i64).available_at(now), now);
        assert_eq!(Delay::from(Duration::seconds(-3)).available_at(now), now);
        assert_eq!(Delay::At(now - Duration::hours(1)).available_at(now), now);
        assert_eq!(Delay::At(now - Duration::hours(1)).seconds_from(now), 0);
    }

    #[test]
    fn relative_and_absolute_delays() {
        let now = Utc::now();

        assert_eq!(Delay::from(30u32).available_at(now), now + Duration::seconds(30));
        assert_eq!(Delay::from(std::time::Duration::from_secs(5)).seconds_from(now), 5);
        assert_eq!(Delay::At(now + Duration::milliseconds(1500)).seconds_from(now), 2);
    }
}
