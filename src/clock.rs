/// Process-relative monotonic clock in milliseconds.
///
/// The reference point is captured on first use so readings start near zero
/// and never wrap for any practical runtime.
use crate::error::fatal;
use nix::time::{clock_gettime, ClockId};
use std::sync::OnceLock;
use std::time::Duration;

static REFERENCE_MILLIS: OnceLock<u64> = OnceLock::new();

fn raw_millis() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1000 + (ts.tv_nsec() as u64) / 1_000_000,
        Err(e) => fatal("unable to read CLOCK_MONOTONIC", e),
    }
}

/// Milliseconds elapsed since the clock was first read in this process.
pub fn now() -> u64 {
    let reference = *REFERENCE_MILLIS.get_or_init(raw_millis);
    raw_millis().saturating_sub(reference)
}

/// Block until at least `duration` has elapsed.
///
/// The remaining time is recomputed from a fixed deadline after every wakeup,
/// so repeated interruptions do not accumulate error.
pub fn sleep_until(duration: Duration) {
    let deadline = now().saturating_add(duration.as_millis() as u64);
    sleep_until_deadline(deadline);
}

/// Block until the clock reads at least `deadline`.
pub fn sleep_until_deadline(deadline: u64) {
    loop {
        let current = now();
        if current >= deadline {
            return;
        }
        std::thread::sleep(Duration::from_millis(deadline - current));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn test_now_starts_near_zero() {
        // The reference is fixed by whichever test reads first, so only a
        // loose upper bound is meaningful here.
        assert!(now() < 10 * 60 * 1000);
    }

    #[test]
    fn test_sleep_until_waits_full_duration() {
        let start = now();
        sleep_until(Duration::from_millis(50));
        let elapsed = now() - start;
        assert!(elapsed >= 50, "slept only {elapsed}ms");
        assert!(elapsed < 2000);
    }

    #[test]
    fn test_sleep_until_past_deadline_returns_immediately() {
        let start = now();
        sleep_until_deadline(0);
        assert!(now() - start < 50);
    }

    #[test]
    fn test_zero_duration() {
        let start = now();
        sleep_until(Duration::ZERO);
        assert!(now() - start < 50);
    }
}
