/// Run a command within a lower and upper runtime bound.
///
/// The upper bound arms a repeating interval timer. Its first expiry is
/// relayed to the child as SIGTERM and every later one as SIGKILL. The lower
/// bound pads the supervisor's own runtime after the child has finished.
use crate::clock;
use crate::config::SupervisorConfig;
use crate::error::{fatal, SupervisorError};
use crate::monitor;
use crate::outcome::ExitOutcome;
use crate::signals::{SignalRelay, TIMEBOUND_SIGNALS};
use crate::supervise::{SuperviseOptions, SupervisionLoop};
use nix::errno::Errno;
use nix::libc::{self, itimerval, suseconds_t, time_t, timeval};
use std::ptr;
use std::time::Duration;

/// Minimum and optional maximum runtime, in whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBounds {
    pub min: u32,
    pub max: Option<u32>,
}

impl TimeBounds {
    pub fn new(min: u32, max: Option<u32>) -> Result<Self, String> {
        if let Some(max) = max {
            if max == 0 {
                return Err("maximum runtime must be positive".to_string());
            }
            if max < min {
                return Err(format!(
                    "maximum runtime {max}s is shorter than minimum runtime {min}s"
                ));
            }
        }
        Ok(Self { min, max })
    }
}

fn timeval_of(duration: Duration) -> timeval {
    timeval {
        tv_sec: duration.as_secs() as time_t,
        tv_usec: duration.subsec_micros() as suseconds_t,
    }
}

fn set_real_timer(value: Duration, interval: Duration) -> Result<(), Errno> {
    let timer = itimerval {
        it_interval: timeval_of(interval),
        it_value: timeval_of(value),
    };
    // SAFETY: timer is a valid itimerval and the old value is not requested.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
    Errno::result(rc).map(drop)
}

/// Armed `ITIMER_REAL`; disarmed on drop.
#[derive(Debug)]
pub struct AlarmTimer {
    _private: (),
}

impl AlarmTimer {
    /// First expiry after `first`, then every `interval`.
    pub fn arm(first: Duration, interval: Duration) -> Result<Self, SupervisorError> {
        set_real_timer(first, interval)
            .map_err(|e| SupervisorError::environment("unable to arm runtime alarm", e))?;
        tracing::debug!(
            first_ms = first.as_millis() as u64,
            interval_ms = interval.as_millis() as u64,
            "runtime alarm armed"
        );
        Ok(Self { _private: () })
    }
}

impl Drop for AlarmTimer {
    fn drop(&mut self) {
        if let Err(e) = set_real_timer(Duration::ZERO, Duration::ZERO) {
            fatal("unable to disarm runtime alarm", e);
        }
    }
}

/// Run `command` to completion within `bounds`.
pub fn run_bounded(
    command: &[String],
    bounds: TimeBounds,
    config: &SupervisorConfig,
) -> Result<ExitOutcome, SupervisorError> {
    let begin = clock::now();

    let mut relay = SignalRelay::new(TIMEBOUND_SIGNALS)?;
    relay.intercept()?;

    let outcome = {
        let _alarm = match bounds.max {
            Some(max) => Some(AlarmTimer::arm(
                Duration::from_secs(u64::from(max)),
                Duration::from_secs(config.timebound.escalation_interval_secs),
            )?),
            None => None,
        };
        let mut monitor = monitor::create(None, TIMEBOUND_SIGNALS, &config.monitor)?;
        let options = SuperviseOptions {
            continue_on_stop: false,
            escalate_alarm: true,
            orphan_grace: Duration::from_millis(config.monitor.orphan_grace_ms),
        };
        SupervisionLoop::new(&relay, options).run(command, monitor.as_mut())
    };
    relay.release()?;
    let outcome = outcome?;

    if matches!(outcome, ExitOutcome::Exited(_) | ExitOutcome::Signaled(_)) {
        let deadline = begin.saturating_add(u64::from(bounds.min) * 1000);
        let now = clock::now();
        if now < deadline {
            tracing::debug!(remaining_ms = deadline - now, "padding to minimum runtime");
            clock::sleep_until_deadline(deadline);
        }
    }

    Ok(outcome)
}
