use hearth::time::unix_now;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Relative time: seconds since process start. 32 bits keep the item header
/// small and comparisons cheap.
pub type RelTime = u32;

/// Largest expiration value still interpreted as a delta from now; anything
/// bigger is an absolute unix timestamp.
pub const REALTIME_MAXDELTA: i64 = 60 * 60 * 24 * 30;

/// The server-relative clock. The dispatcher ticks it once per poll
/// iteration so request handling reads a cached value instead of making a
/// syscall per request.
///
/// Process start is backdated by two seconds so that a relative timestamp of
/// zero can always mean "never" without colliding with items stored in the
/// first instant of uptime.
pub struct Clock {
    started: u64,
    origin: Instant,
    current: AtomicU32,
}

impl Clock {
    pub fn new() -> Clock {
        Clock {
            started: unix_now() - 2,
            origin: Instant::now(),
            current: AtomicU32::new(2),
        }
    }

    /// Refreshes the cached relative time from the monotonic clock.
    #[inline]
    pub fn tick(&self) {
        let now = self.origin.elapsed().as_secs() as u32 + 2;
        self.current.store(now, Ordering::Relaxed);
    }

    /// Current seconds-since-start.
    #[inline]
    pub fn now(&self) -> RelTime {
        self.current.load(Ordering::Relaxed)
    }

    /// Unix timestamp of (backdated) process start.
    #[inline]
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Decodes a client-supplied expiration into relative time. Zero means
    /// never. Values within 30 days are deltas from now; larger values are
    /// absolute unix timestamps. An absolute time at or before process start
    /// clamps to one second after start so it expires instead of becoming
    /// "never".
    pub fn realtime(&self, exptime: i64) -> RelTime {
        if exptime == 0 {
            return 0;
        }

        if exptime > REALTIME_MAXDELTA {
            if exptime as u64 <= self.started {
                return 1;
            }
            (exptime as u64 - self.started) as RelTime
        } else {
            let t = i64::from(self.now()) + exptime;
            if t <= 0 {
                1
            } else {
                t as RelTime
            }
        }
    }

    /// Pins the relative clock to an arbitrary value. Test hook: engine
    /// tests advance time by hand instead of sleeping.
    #[cfg(test)]
    pub(crate) fn set(&self, now: RelTime) {
        self.current.store(now, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_never_expires() {
        let clock = Clock::new();
        assert_eq!(clock.realtime(0), 0);
    }

    #[test]
    fn test_delta_is_relative_to_now() {
        let clock = Clock::new();
        clock.set(100);
        assert_eq!(clock.realtime(60), 160);
        assert_eq!(clock.realtime(REALTIME_MAXDELTA), 100 + REALTIME_MAXDELTA as u32);
    }

    #[test]
    fn test_absolute_past_maxdelta() {
        let clock = Clock::new();
        let abs = clock.started() as i64 + 5000;
        assert_eq!(clock.realtime(abs), 5000);
    }

    #[test]
    fn test_absolute_before_start_clamps() {
        let clock = Clock::new();
        assert_eq!(clock.realtime(clock.started() as i64), 1);
        assert_eq!(clock.realtime(REALTIME_MAXDELTA + 1), 1);
    }

    #[test]
    fn test_negative_delta_expires_immediately() {
        let clock = Clock::new();
        clock.set(50);
        assert_eq!(clock.realtime(-100), 1);
        assert_eq!(clock.realtime(-10), 40);
    }
}
