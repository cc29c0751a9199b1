use nix::errno::Errno;
use std::path::PathBuf;

/// Errors raised while creating the child process.
///
/// None of these are fatal to the supervisor: the supervision loop logs them
/// and reports [`ExitOutcome::LaunchFailed`](crate::outcome::ExitOutcome::LaunchFailed).
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The command was empty or an argument contained a NUL byte.
    #[error("invalid command: {0}")]
    Command(String),
    /// The exec notification channel could not be created.
    #[error("unable to create exec notification pipe: {0}")]
    Pipe(#[source] Errno),
    /// `fork(2)` failed.
    #[error("unable to fork new process: {0}")]
    Fork(#[source] Errno),
    /// The child reported that replacing its program image failed.
    #[error("unable to execute {program}: {errno}")]
    Exec {
        program: String,
        #[source]
        errno: Errno,
    },
    /// The notification channel yielded neither EOF nor a complete error code.
    #[error("exec handshake with child {pid} failed: {errno}")]
    Handshake {
        pid: i32,
        #[source]
        errno: Errno,
    },
}

/// Errors loading the optional TOML configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Conditions that end supervision with status 255.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The host refused an operation the supervisor cannot work without
    /// (signal masks, dispositions, timers, waiting for the child).
    #[error("{context}: {errno}")]
    Environment {
        context: String,
        #[source]
        errno: Errno,
    },
    /// A signal number does not fit the pending signal bitmask.
    #[error("signal {0} exceeds pending signal set size")]
    SignalOutOfRange(i32),
    /// The child kept failing immediately after launch.
    #[error("failed to start {program} after {attempts} rapid attempts")]
    CrashLoop { program: String, attempts: u32 },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SupervisorError {
    pub(crate) fn environment(context: impl Into<String>, errno: Errno) -> Self {
        SupervisorError::Environment {
            context: context.into(),
            errno,
        }
    }
}

/// Log a fatal environment fault and terminate the supervisor immediately.
///
/// Used where an error cannot be propagated, such as inside `Drop`.
pub fn fatal(context: &str, error: impl std::fmt::Display) -> ! {
    tracing::error!(error = %error, "{context}");
    std::process::exit(255)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_error_names_program() {
        let err = LaunchError::Exec {
            program: "nonexistent-binary-xyz".to_string(),
            errno: Errno::ENOENT,
        };
        let msg = err.to_string();
        assert!(msg.contains("unable to execute nonexistent-binary-xyz"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_crash_loop_message() {
        let err = SupervisorError::CrashLoop {
            program: "/bin/false".to_string(),
            attempts: 10,
        };
        assert_eq!(
            err.to_string(),
            "failed to start /bin/false after 10 rapid attempts"
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_fatal_exits_with_failure_status() {
        use nix::sys::wait::{waitpid, WaitStatus};
        use nix::unistd::{fork, ForkResult};

        let err = SupervisorError::environment("unable to reset signal SIGHUP", Errno::EINVAL);
        // SAFETY: the child goes straight to fatal, which exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => fatal("failed to release intercepted signals", err),
            ForkResult::Parent { child } => {
                assert_eq!(
                    waitpid(child, None).unwrap(),
                    WaitStatus::Exited(child, 255)
                );
            }
        }
    }

    #[test]
    fn test_environment_error_carries_context() {
        let err = SupervisorError::environment("unable to set blocking signal mask", Errno::EINVAL);
        assert!(err.to_string().starts_with("unable to set blocking signal mask"));
    }
}
