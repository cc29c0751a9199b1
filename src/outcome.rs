/// Composite outcome of a supervised run, and how the supervisor turns it
/// into its own termination.
use crate::signals;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpid, Pid};
use std::fmt;

/// Status used for launch failures and fatal supervisor errors.
pub const FAILURE_STATUS: i32 = 255;

/// How the supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The child exited normally with this status.
    Exited(u8),
    /// The child was terminated by this signal.
    Signaled(Signal),
    /// The child could not be started.
    LaunchFailed,
    /// Supervision was abandoned because the watched ancestor exited.
    /// Treated exactly like `LaunchFailed` by every caller.
    Aborted { ancestor: Pid },
}

impl ExitOutcome {
    /// Offset separating signal terminations from exit statuses.
    pub const SIGNAL_BASE: i32 = 256;

    /// Single-integer encoding: `status` for exits, `256 + signal` for signals.
    /// Failures have no encoding.
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(status) => Some(i32::from(*status)),
            ExitOutcome::Signaled(signal) => Some(Self::SIGNAL_BASE + *signal as i32),
            ExitOutcome::LaunchFailed | ExitOutcome::Aborted { .. } => None,
        }
    }

    /// Inverse of [`code`](Self::code).
    #[cfg(test)]
    pub(crate) fn from_code(code: i32) -> Option<Self> {
        match code {
            0..=255 => Some(ExitOutcome::Exited(code as u8)),
            c if c > Self::SIGNAL_BASE => Signal::try_from(c - Self::SIGNAL_BASE)
                .ok()
                .map(ExitOutcome::Signaled),
            _ => None,
        }
    }

    /// The child never ran to a classifiable end.
    pub fn is_failure(&self) -> bool {
        matches!(self, ExitOutcome::LaunchFailed | ExitOutcome::Aborted { .. })
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Exited(status) => write!(f, "exited with status {status}"),
            ExitOutcome::Signaled(signal) => write!(f, "terminated by {signal}"),
            ExitOutcome::LaunchFailed => write!(f, "failed to launch"),
            ExitOutcome::Aborted { ancestor } => {
                write!(f, "abandoned after ancestor {ancestor} exited")
            }
        }
    }
}

/// Terminate this process so that its own parent observes `outcome`.
///
/// Exits with the child's status, or re-raises the child's terminating
/// signal against this process. Failures exit with [`FAILURE_STATUS`].
pub fn exit_with(outcome: ExitOutcome) -> ! {
    match outcome {
        ExitOutcome::Exited(status) => std::process::exit(i32::from(status)),
        ExitOutcome::Signaled(signal) => {
            if let Err(e) = signals::reset_default(signal) {
                tracing::warn!(error = %e, "unable to reset disposition before re-raising");
            }
            tracing::debug!(%signal, "re-raising child termination signal");
            if let Err(e) = kill(getpid(), signal) {
                tracing::warn!(error = %e, %signal, "unable to re-raise signal");
            }
            // Still here: the signal does not terminate this process.
            std::process::exit(FAILURE_STATUS)
        }
        ExitOutcome::LaunchFailed | ExitOutcome::Aborted { .. } => {
            std::process::exit(FAILURE_STATUS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_and_signal_codes_are_disjoint() {
        for n in 1..32 {
            let Ok(signal) = Signal::try_from(n) else {
                continue;
            };
            let exited = ExitOutcome::Exited(n as u8).code().unwrap();
            let signaled = ExitOutcome::Signaled(signal).code().unwrap();
            assert_eq!(exited, n);
            assert_eq!(signaled, 256 + n);
            assert_ne!(exited, signaled);
        }
        assert_eq!(ExitOutcome::Exited(255).code(), Some(255));
    }

    #[test]
    fn test_failures_have_no_code() {
        assert_eq!(ExitOutcome::LaunchFailed.code(), None);
        let aborted = ExitOutcome::Aborted {
            ancestor: Pid::from_raw(1),
        };
        assert_eq!(aborted.code(), None);
        assert!(aborted.is_failure());
        assert!(!ExitOutcome::Exited(1).is_failure());
    }

    #[test]
    fn test_from_code_decodes_both_spaces() {
        assert_eq!(ExitOutcome::from_code(0), Some(ExitOutcome::Exited(0)));
        assert_eq!(ExitOutcome::from_code(42), Some(ExitOutcome::Exited(42)));
        assert_eq!(
            ExitOutcome::from_code(256 + Signal::SIGTERM as i32),
            Some(ExitOutcome::Signaled(Signal::SIGTERM))
        );
        assert_eq!(ExitOutcome::from_code(256), None);
        assert_eq!(ExitOutcome::from_code(-1), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitOutcome::Exited(3).to_string(), "exited with status 3");
        assert_eq!(
            ExitOutcome::Signaled(Signal::SIGKILL).to_string(),
            "terminated by SIGKILL"
        );
    }
}
