/// The supervision loop: launch the child once, relay pending signals,
/// block on the monitor, and classify child state changes until the child
/// exits, is killed by a signal, or cannot be supervised any further.
use crate::error::SupervisorError;
use crate::launch::{self, ChildProcess};
use crate::monitor::{MonitorEvent, ProcessMonitor};
use crate::outcome::ExitOutcome;
use crate::signals::SignalRelay;
use crate::watchdog;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::getpid;
use std::time::Duration;

/// Per-invocation behaviour switches.
#[derive(Debug, Clone, Copy)]
pub struct SuperviseOptions {
    /// Continue a child stopped by SIGSTOP/SIGTSTP instead of stopping the supervisor.
    pub continue_on_stop: bool,
    /// Translate relayed alarms into SIGTERM, then SIGKILL.
    pub escalate_alarm: bool,
    /// Grace period between terminating and killing an orphaned process group.
    pub orphan_grace: Duration,
}

impl Default for SuperviseOptions {
    fn default() -> Self {
        Self {
            continue_on_stop: false,
            escalate_alarm: false,
            orphan_grace: Duration::from_secs(1),
        }
    }
}

/// Alarm translation: the first alarm asks politely, later ones do not.
#[derive(Debug, Default)]
pub struct Escalation {
    alarms: u32,
}

impl Escalation {
    /// Signal to deliver in place of the next alarm.
    pub fn next_signal(&mut self) -> Signal {
        self.alarms = self.alarms.saturating_add(1);
        if self.alarms == 1 {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        }
    }

    pub fn alarms(&self) -> u32 {
        self.alarms
    }
}

enum Reaped {
    Running,
    Transition,
    Done(ExitOutcome),
}

pub struct SupervisionLoop<'a> {
    relay: &'a SignalRelay,
    options: SuperviseOptions,
    escalation: Escalation,
}

impl<'a> SupervisionLoop<'a> {
    pub fn new(relay: &'a SignalRelay, options: SuperviseOptions) -> Self {
        Self {
            relay,
            options,
            escalation: Escalation::default(),
        }
    }

    /// Supervise one launch of `command` to completion.
    pub fn run(
        &mut self,
        command: &[String],
        monitor: &mut dyn ProcessMonitor,
    ) -> Result<ExitOutcome, SupervisorError> {
        let child = match launch::launch(command) {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(error = %e, "launch failed");
                return Ok(ExitOutcome::LaunchFailed);
            }
        };

        loop {
            self.relay_pending(&child)?;

            match monitor.wait()? {
                MonitorEvent::AncestorExited(ancestor) => {
                    watchdog::abandon(&child, self.options.orphan_grace)?;
                    return Ok(ExitOutcome::Aborted { ancestor });
                }
                MonitorEvent::ChildSignaled | MonitorEvent::Interrupted => {}
            }

            loop {
                match self.reap(&child)? {
                    Reaped::Running => break,
                    Reaped::Transition => continue,
                    Reaped::Done(outcome) => return Ok(outcome),
                }
            }
        }
    }

    /// Deliver every sampled signal to the child, in ascending order.
    fn relay_pending(&mut self, child: &ChildProcess) -> Result<(), SupervisorError> {
        let pending = self.relay.sample()?;
        for signal in pending.iter() {
            let signal = if signal == Signal::SIGALRM && self.options.escalate_alarm {
                let escalated = self.escalation.next_signal();
                tracing::debug!(
                    %escalated,
                    alarms = self.escalation.alarms(),
                    "using signal for expired alarm"
                );
                escalated
            } else {
                signal
            };

            tracing::debug!(%signal, pid = %child.pid(), "delivering signal to child process");
            if let Err(e) = kill(child.pid(), signal) {
                tracing::warn!(
                    error = %e,
                    %signal,
                    pid = %child.pid(),
                    "unable to deliver signal"
                );
            }
        }
        Ok(())
    }

    fn reap(&mut self, child: &ChildProcess) -> Result<Reaped, SupervisorError> {
        let flags = WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED | WaitPidFlag::WNOHANG;
        let pid = child.pid();
        let status = match waitpid(pid, Some(flags)) {
            Ok(status) => status,
            Err(Errno::EINTR) => return Ok(Reaped::Transition),
            Err(e) => {
                return Err(SupervisorError::environment(
                    format!("unable to wait for child process {pid}"),
                    e,
                ))
            }
        };

        match status {
            WaitStatus::StillAlive => Ok(Reaped::Running),
            WaitStatus::Stopped(_, signal) => {
                tracing::debug!(%pid, %signal, "child process stopped");
                self.on_stop(signal)?;
                Ok(Reaped::Transition)
            }
            WaitStatus::Continued(_) => {
                tracing::debug!(%pid, "child process continued");
                Ok(Reaped::Transition)
            }
            WaitStatus::Exited(_, status) => {
                tracing::debug!(%pid, program = child.program(), status, "child process exited");
                Ok(Reaped::Done(ExitOutcome::Exited(status as u8)))
            }
            WaitStatus::Signaled(_, signal, _) => {
                tracing::debug!(
                    %pid,
                    program = child.program(),
                    %signal,
                    "child process terminated by signal"
                );
                Ok(Reaped::Done(ExitOutcome::Signaled(signal)))
            }
            #[allow(unreachable_patterns)]
            _ => Ok(Reaped::Transition),
        }
    }

    /// Propagate a job-control stop to the supervisor, or continue the child.
    fn on_stop(&mut self, signal: Signal) -> Result<(), SupervisorError> {
        let convertible = matches!(signal, Signal::SIGSTOP | Signal::SIGTSTP);
        if convertible && self.options.continue_on_stop {
            tracing::debug!(%signal, "continuing stopped child");
            return self.relay.queue(Signal::SIGCONT);
        }

        // Stop alongside the child; the SIGCONT that resumes us is relayed.
        if let Err(e) = kill(getpid(), signal) {
            tracing::warn!(error = %e, %signal, "unable to stop process after child stopped");
        }
        Ok(())
    }
}
