//! Batch counting and idle-cycle throttling.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::options::{OptionsError, SleepOption};

/// Counts handled events towards the persistence threshold.
#[derive(Debug, Clone)]
pub struct EventCounter {
    block_size: u64,
    count: u64,
}

impl EventCounter {
    /// Counter that reaches its threshold every `block_size` events.
    pub fn new(block_size: u64) -> Self {
        Self {
            block_size,
            count: 0,
        }
    }

    /// Count one handled event.
    pub fn increment(&mut self) {
        self.count += 1;
    }

    /// Returns `true` once `block_size` events were counted since the last reset.
    pub fn is_reached(&self) -> bool {
        self.count >= self.block_size
    }

    /// Returns `true` when nothing was counted since the last reset.
    pub fn is_reset(&self) -> bool {
        self.count == 0
    }

    /// Start counting the next block.
    pub fn reset(&mut self) {
        self.count = 0;
    }

    /// Events counted since the last reset.
    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Rate limiter pacing the token-bucket form of the idle delay.
type IdleLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Paces cycles that loaded no events.
///
/// A fixed delay always waits the same amount. A token bucket lets `rate`
/// idle cycles through per `per_seconds` window and only waits once the
/// bucket runs dry.
#[derive(Clone)]
pub enum IdleThrottle {
    Fixed(Duration),
    Bucket(Arc<IdleLimiter>),
}

impl IdleThrottle {
    /// Build the throttle configured by `sleep`.
    ///
    /// # Errors
    ///
    /// Returns [`OptionsError::InvalidBucket`] for a bucket with a zero rate
    /// or window.
    pub fn from_option(option: &SleepOption) -> Result<Self, OptionsError> {
        match *option {
            SleepOption::Millis(ms) => Ok(Self::Fixed(Duration::from_millis(ms))),
            SleepOption::Bucket(rate, per_seconds) => {
                let invalid = || OptionsError::InvalidBucket { rate, per_seconds };
                let burst = NonZeroU32::new(rate).ok_or_else(invalid)?;
                let period = Duration::from_secs(u64::from(per_seconds)) / burst.get();
                let quota = Quota::with_period(period)
                    .ok_or_else(invalid)?
                    .allow_burst(burst);
                Ok(Self::Bucket(Arc::new(RateLimiter::direct(quota))))
            }
        }
    }

    /// Wait before the next idle cycle.
    pub async fn sleep(&self) {
        let delay = match self {
            Self::Fixed(delay) => *delay,
            Self::Bucket(limiter) => match limiter.check() {
                Ok(()) => Duration::ZERO,
                Err(not_until) => {
                    not_until.wait_time_from(governor::clock::Clock::now(&DefaultClock::default()))
                }
            },
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl std::fmt::Debug for IdleThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Bucket(_) => f.debug_tuple("Bucket").field(&"<RateLimiter>").finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn counter_reaches_block_size() {
        let mut counter = EventCounter::new(3);
        assert!(counter.is_reset());
        counter.increment();
        counter.increment();
        assert!(!counter.is_reached());
        counter.increment();
        assert!(counter.is_reached());
        assert_eq!(counter.count(), 3);

        counter.reset();
        assert!(counter.is_reset());
        assert!(!counter.is_reached());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_throttle_sleeps_full_delay() {
        let throttle = IdleThrottle::from_option(&SleepOption::Millis(100)).expect("throttle");
        let started = Instant::now();
        throttle.sleep().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_fixed_delay_does_not_sleep() {
        let throttle = IdleThrottle::from_option(&SleepOption::Millis(0)).expect("throttle");
        let started = Instant::now();
        throttle.sleep().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_waits() {
        let throttle = IdleThrottle::from_option(&SleepOption::Bucket(3, 1)).expect("throttle");
        let started = Instant::now();
        for _ in 0..3 {
            throttle.sleep().await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);

        // One token every third of a second once the burst is spent.
        throttle.sleep().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(300), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(334), "waited {waited:?}");
    }

    #[test]
    fn empty_bucket_cannot_be_built() {
        for option in [SleepOption::Bucket(0, 1), SleepOption::Bucket(2, 0)] {
            let err = IdleThrottle::from_option(&option).expect_err("empty bucket");
            assert!(matches!(err, OptionsError::InvalidBucket { .. }));
        }
    }
}
