//! Mockable time source consulted by recurrence, lock-expiry and debounce math.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Wall-clock plus monotonic time source, kept behind a trait so tests can
/// substitute [`MockClock`] instead of sleeping in real time.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current monotonic instant, used for timer placement math that must
    /// not be perturbed by wall-clock adjustments.
    fn monotonic_now(&self) -> Instant;
}

/// Production clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }
}

/// Settable/advanceable clock for deterministic tests of recurrence,
/// debounce and lock-expiry timing (§10.5).
#[derive(Clone)]
pub struct MockClock {
    inner: Arc<RwLock<DateTime<Utc>>>,
    started: Instant,
}

impl MockClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(now)),
            started: Instant::now(),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.inner.write() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.inner.write();
        *guard += delta;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.read()
    }

    fn monotonic_now(&self) -> Instant {
        // Monotonic side just tracks wall-clock elapsed from construction;
        // good enough for timer-placement assertions in tests.
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances_independent_of_wall_clock() {
        let clock = MockClock::at(DateTime::<Utc>::UNIX_EPOCH);
        clock.advance(chrono::Duration::seconds(30));
        assert_eq!(
            clock.now(),
            DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(30)
        );
    }
}
