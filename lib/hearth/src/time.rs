use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, as the wall clock reports them. The cache
/// only needs this once at startup to anchor its relative clock.
#[inline]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is set before the unix epoch")
        .as_secs()
}
