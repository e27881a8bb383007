//! Strictly increasing process-wide timestamps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Issues microsecond timestamps that never repeat and never move backward
/// within the process, even when the system clock stalls or steps back.
#[derive(Default)]
pub struct MonotonicClock {
    last_us: AtomicU64,
}

impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock::default()
    }

    /// `max(real_now, last + 1)`, atomically.
    pub fn now_us(&self) -> u64 {
        let real = system_time_us();
        self.last_us
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(real.max(last + 1))
            })
            .map(|last| real.max(last + 1))
            .unwrap_or(real)
    }
}

fn system_time_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

/// Sleep in small slices so process shutdown can interrupt the wait.
/// Returns false when the shutdown flag was raised before the duration
/// elapsed.
pub fn sleep_unless(shutdown: &AtomicBool, dur: Duration) -> bool {
    let slice = Duration::from_millis(20);
    let mut remaining = dur;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
    !shutdown.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase() {
        let clock = MonotonicClock::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let now = clock.now_us();
            assert!(now > prev);
            prev = now;
        }
    }

    #[test]
    fn concurrent_callers_never_collide() {
        use std::collections::HashSet;
        use std::sync::Arc;

        let clock = Arc::new(MonotonicClock::new());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                (0..2_000).map(|_| clock.now_us()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for ts in handle.join().unwrap() {
                assert!(seen.insert(ts), "duplicate timestamp {ts}");
            }
        }
    }

    #[test]
    fn sleep_unless_honors_shutdown() {
        let shutdown = AtomicBool::new(true);
        assert!(!sleep_unless(&shutdown, Duration::from_secs(5)));
    }
}
