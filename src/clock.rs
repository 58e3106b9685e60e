//! Process clock shared by the acquisition and streaming paths.
//!
//! All timestamps inside the server are "system seconds": a monotonic f64
//! anchored at an arbitrary origin, immune to wall-clock steps. Outbound wire
//! timestamps are UTC; the offset between the two is computed once when the
//! clock is created and reused for every conversion, so a frame's wire
//! timestamp never jumps if NTP adjusts the host clock mid-stream.
//!
//! The clock is created once at startup and handed to consumers as an
//! `Arc<Clock>`; nothing reads a process-wide global.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub struct Clock {
    origin: Instant,
    /// UTC seconds at `origin`; `universal = system + utc_offset`.
    utc_offset: f64,
}

impl Clock {
    pub fn new() -> Self {
        let origin = Instant::now();
        let utc_offset = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self { origin, utc_offset }
    }

    /// Monotonic seconds since clock creation.
    #[inline]
    pub fn system_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    /// Convert a system timestamp to UTC seconds since the Unix epoch.
    #[inline]
    pub fn universal_from_system(&self, system_ts: f64) -> f64 {
        system_ts + self.utc_offset
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_time_monotonic() {
        let clock = Clock::new();
        let a = clock.system_time();
        let b = clock.system_time();
        assert!(b >= a);
    }

    #[test]
    fn test_universal_offset_is_constant() {
        let clock = Clock::new();
        let t = clock.system_time();
        let u1 = clock.universal_from_system(t);
        let u2 = clock.universal_from_system(t);
        assert_eq!(u1, u2);
        assert!(u1 > 1.0e9); // sometime after 2001
    }
}
