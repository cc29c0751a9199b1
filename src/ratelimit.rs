/// Backoff window arithmetic for restarts after medium-length runs.
///
/// The window grows as `(w + 1) * 2` seconds, capped at a maximum, and the
/// actual delay is drawn uniformly from `[0, w)` so that supervisors started
/// together do not retry in lockstep.
use rand::Rng;
use std::time::Duration;

/// Next backoff window in seconds: `min(max, (window + 1) * 2)`.
pub fn next_window(window_secs: u64, max_secs: u64) -> u64 {
    window_secs
        .saturating_add(1)
        .saturating_mul(2)
        .min(max_secs)
}

/// Uniformly random delay in `[0, window)`, at millisecond resolution.
pub fn jitter<R: Rng + ?Sized>(rng: &mut R, window_secs: u64) -> Duration {
    let window_ms = window_secs.saturating_mul(1000);
    if window_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..window_ms))
}
