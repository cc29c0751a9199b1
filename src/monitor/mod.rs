/// Process monitors: block until the child changes state or a watched
/// ancestor disappears.
///
/// The BSD kernel event queue is used where available. Everywhere else a
/// self-pipe armed by `SIGCHLD` plus a periodic ancestor liveness check
/// provides the same contract.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub mod kqueue;
pub mod self_pipe;

use crate::config::MonitorConfig;
use crate::error::SupervisorError;
use nix::libc::c_int;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Why [`ProcessMonitor::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// A child state change was signalled.
    ChildSignaled,
    /// The watched ancestor has terminated.
    AncestorExited(Pid),
    /// Woken by some other signal; nothing to report.
    Interrupted,
}

/// Event source driving the supervision loop.
pub trait ProcessMonitor {
    /// Short name for logs (e.g. "kqueue", "self-pipe").
    fn name(&self) -> &str;

    /// Block until something happens. Never busy-polls.
    fn wait(&mut self) -> Result<MonitorEvent, SupervisorError>;
}

/// Create the best monitor for this platform.
///
/// `relayed` lists the signals the supervisor intercepts, so that a signal
/// arriving just before the monitor blocks still wakes it.
pub fn create(
    ancestor: Option<Pid>,
    relayed: &[Signal],
    config: &MonitorConfig,
) -> Result<Box<dyn ProcessMonitor>, SupervisorError> {
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd"
    ))]
    let monitor: Box<dyn ProcessMonitor> = {
        let _ = config;
        Box::new(kqueue::KqueueMonitor::new(ancestor, relayed)?)
    };

    #[cfg(not(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd"
    )))]
    let monitor: Box<dyn ProcessMonitor> = {
        let _ = relayed;
        Box::new(self_pipe::SelfPipeMonitor::new(
            ancestor,
            std::time::Duration::from_millis(config.ancestor_poll_ms),
        )?)
    };

    tracing::debug!(monitor = monitor.name(), ?ancestor, "process monitor ready");
    Ok(monitor)
}

/// Wake whichever self-pipe monitor is active. Called from signal handlers.
pub(crate) fn wake(signum: c_int) {
    self_pipe::poke(signum);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_create_names_platform_monitor() {
        let monitor = create(None, &[], &MonitorConfig::default()).unwrap();
        let expected = if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "dragonfly",
            target_os = "netbsd",
            target_os = "openbsd"
        )) {
            "kqueue"
        } else {
            "self-pipe"
        };
        assert_eq!(monitor.name(), expected);
    }
}
