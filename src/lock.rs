//! Optimistic, timestamp-based projection lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Computes lock expiries for one projector.
///
/// The lock itself lives in the repository record as `locked_until`; this
/// type only decides what to write and when. A lock is held as long as
/// `locked_until` is in the future, so a crashed holder releases it simply by
/// letting it expire.
#[derive(Debug, Clone)]
pub struct LockManager {
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
    lockout: chrono::Duration,
    last_lock: Option<DateTime<Utc>>,
}

impl LockManager {
    /// # Arguments
    ///
    /// * `timeout` - Lock lifetime; every write sets `locked_until = now + timeout`.
    /// * `lockout` - Minimum interval between two refreshes. Zero refreshes
    ///   on every request.
    pub fn new(clock: Arc<dyn Clock>, timeout: chrono::Duration, lockout: chrono::Duration) -> Self {
        Self {
            clock,
            timeout,
            lockout,
            last_lock: None,
        }
    }

    /// Start holding the lock and return the expiry to write.
    pub fn acquire(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        self.last_lock = Some(now);
        self.expiry_from(now)
    }

    /// Returns `true` when `lockout` has elapsed since the last write.
    pub fn should_refresh(&self) -> bool {
        match self.last_lock {
            None => true,
            Some(last) => last
                .checked_add_signed(self.lockout)
                .is_some_and(|next| self.clock.now() >= next),
        }
    }

    /// Extend the lock and return the new expiry to write.
    pub fn refresh(&mut self) -> DateTime<Utc> {
        self.acquire()
    }

    /// Expiry of the last written lock.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.last_lock.map(|last| self.expiry_from(last))
    }

    /// `from + timeout`, saturating at the latest representable instant.
    fn expiry_from(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_signed(self.timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Current time on the lock's clock.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Forget the held lock.
    pub fn release(&mut self) {
        self.last_lock = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::event::test_fixtures::{at, epoch};

    fn manager(timeout_ms: i64, lockout_ms: i64) -> (LockManager, ManualClock) {
        let clock = ManualClock::new(epoch());
        let lock = LockManager::new(
            Arc::new(clock.clone()),
            chrono::Duration::milliseconds(timeout_ms),
            chrono::Duration::milliseconds(lockout_ms),
        );
        (lock, clock)
    }

    #[test]
    fn acquire_sets_expiry_from_timeout() {
        let (mut lock, _) = manager(1000, 0);
        assert_eq!(lock.current(), None);
        assert_eq!(lock.acquire(), at(1));
        assert_eq!(lock.current(), Some(at(1)));
    }

    #[test]
    fn zero_lockout_always_refreshes() {
        let (mut lock, _) = manager(1000, 0);
        lock.acquire();
        assert!(lock.should_refresh());
    }

    #[test]
    fn lockout_throttles_refresh() {
        let (mut lock, clock) = manager(5000, 2000);
        lock.acquire();
        clock.advance(chrono::Duration::milliseconds(1999));
        assert!(!lock.should_refresh());

        clock.advance(chrono::Duration::milliseconds(1));
        assert!(lock.should_refresh());
        assert_eq!(lock.refresh(), at(7));
    }

    #[test]
    fn huge_timeout_saturates_instead_of_overflowing() {
        let clock = ManualClock::new(epoch());
        let mut lock = LockManager::new(
            Arc::new(clock),
            chrono::Duration::milliseconds(i64::MAX),
            chrono::Duration::milliseconds(i64::MAX),
        );
        assert_eq!(lock.acquire(), DateTime::<Utc>::MAX_UTC);
        assert_eq!(lock.current(), Some(DateTime::<Utc>::MAX_UTC));
        assert!(!lock.should_refresh());
    }

    #[test]
    fn release_forgets_lock() {
        let (mut lock, _) = manager(1000, 500);
        lock.acquire();
        lock.release();
        assert_eq!(lock.current(), None);
        assert!(lock.should_refresh());
    }
}
