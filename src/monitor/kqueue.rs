use super::{MonitorEvent, ProcessMonitor};
use crate::error::SupervisorError;
use nix::errno::Errno;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Monitor built on the BSD kernel event queue.
///
/// `EVFILT_SIGNAL` records delivery attempts even for caught signals, so
/// registering every relayed signal closes the window between sampling the
/// pending set and blocking here.
pub struct KqueueMonitor {
    kq: Kqueue,
    /// Set when the ancestor was already gone at registration time.
    exited: Option<Pid>,
}

fn signal_event(signal: Signal) -> KEvent {
    KEvent::new(
        signal as i32 as usize,
        EventFilter::EVFILT_SIGNAL,
        EventFlag::EV_ADD | EventFlag::EV_ENABLE,
        FilterFlag::empty(),
        0,
        0,
    )
}

impl KqueueMonitor {
    pub fn new(ancestor: Option<Pid>, relayed: &[Signal]) -> Result<Self, SupervisorError> {
        let kq = Kqueue::new()
            .map_err(|e| SupervisorError::environment("unable to create kqueue", e))?;

        let mut changes = vec![signal_event(Signal::SIGCHLD)];
        changes.extend(relayed.iter().map(|&s| signal_event(s)));
        kq.kevent(&changes, &mut [], None)
            .map_err(|e| SupervisorError::environment("unable to register signal events", e))?;

        let mut exited = None;
        if let Some(pid) = ancestor {
            let watch = KEvent::new(
                pid.as_raw() as usize,
                EventFilter::EVFILT_PROC,
                EventFlag::EV_ADD | EventFlag::EV_ENABLE,
                FilterFlag::NOTE_EXIT,
                0,
                0,
            );
            match kq.kevent(&[watch], &mut [], None) {
                Ok(_) => {}
                Err(Errno::ESRCH) => exited = Some(pid),
                Err(e) => {
                    return Err(SupervisorError::environment(
                        format!("unable to watch ancestor {pid}"),
                        e,
                    ))
                }
            }
        }

        tracing::debug!(ancestor = ?ancestor, "kqueue monitor armed");
        Ok(Self { kq, exited })
    }
}

impl ProcessMonitor for KqueueMonitor {
    fn name(&self) -> &str {
        "kqueue"
    }

    fn wait(&mut self) -> Result<MonitorEvent, SupervisorError> {
        if let Some(pid) = self.exited {
            return Ok(MonitorEvent::AncestorExited(pid));
        }

        let mut events = [KEvent::new(
            0,
            EventFilter::EVFILT_SIGNAL,
            EventFlag::empty(),
            FilterFlag::empty(),
            0,
            0,
        )];

        let n = match self.kq.kevent(&[], &mut events, None) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(MonitorEvent::Interrupted),
            Err(e) => return Err(SupervisorError::environment("unable to wait on kqueue", e)),
        };
        if n == 0 {
            return Ok(MonitorEvent::Interrupted);
        }

        let event = &events[0];
        match event.filter() {
            Ok(EventFilter::EVFILT_PROC) => {
                let pid = Pid::from_raw(event.ident() as i32);
                self.exited = Some(pid);
                Ok(MonitorEvent::AncestorExited(pid))
            }
            Ok(EventFilter::EVFILT_SIGNAL) if event.ident() == Signal::SIGCHLD as i32 as usize => {
                Ok(MonitorEvent::ChildSignaled)
            }
            _ => Ok(MonitorEvent::Interrupted),
        }
    }
}
