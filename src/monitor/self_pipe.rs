use super::{MonitorEvent, ProcessMonitor};
use crate::error::{fatal, SupervisorError};
use crate::signals::SignalBlock;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc::{self, c_int, c_void};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{getppid, pipe, read, Pid};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

/// Write end of the active monitor's pipe, or -1.
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Write the signal number into the active pipe. Async-signal-safe.
pub(crate) fn poke(signum: c_int) {
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let saved = Errno::last_raw();
    let byte = signum as u8;
    // SAFETY: write(2) is async-signal-safe and the descriptor is non-blocking,
    // so a full pipe drops the byte instead of stalling the handler.
    unsafe {
        libc::write(fd, &byte as *const u8 as *const c_void, 1);
    }
    Errno::set_raw(saved);
}

extern "C" fn on_child(signum: c_int) {
    poke(signum);
}

fn configure(fd: &OwnedFd) -> Result<(), SupervisorError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))
        .map_err(|e| SupervisorError::environment("unable to set O_NONBLOCK on monitor pipe", e))?;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| SupervisorError::environment("unable to set FD_CLOEXEC on monitor pipe", e))?;
    Ok(())
}

/// Portable monitor: a `SIGCHLD` handler writes into a pipe that `wait`
/// polls, and the ancestor is checked for liveness on every wakeup and at
/// least once per poll interval.
pub struct SelfPipeMonitor {
    read_end: OwnedFd,
    write_end: OwnedFd,
    ancestor: Option<Pid>,
    /// The ancestor was our direct parent when the monitor was created.
    ancestor_is_parent: bool,
    poll_interval: Duration,
    saved_sigchld: Option<SigAction>,
}

impl SelfPipeMonitor {
    pub fn new(ancestor: Option<Pid>, poll_interval: Duration) -> Result<Self, SupervisorError> {
        let (read_end, write_end) =
            pipe().map_err(|e| SupervisorError::environment("unable to create monitor pipe", e))?;
        configure(&read_end)?;
        configure(&write_end)?;

        WAKE_FD
            .compare_exchange(-1, write_end.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                SupervisorError::environment("another process monitor is active", Errno::EBUSY)
            })?;

        let mut monitor = Self {
            read_end,
            write_end,
            ancestor,
            ancestor_is_parent: ancestor.is_some_and(|pid| pid == getppid()),
            poll_interval,
            saved_sigchld: None,
        };

        // No SA_NOCLDSTOP: stops and continues must wake the loop too.
        let action = SigAction::new(SigHandler::Handler(on_child), SaFlags::empty(), SigSet::all());
        // SAFETY: on_child only performs an async-signal-safe write.
        let saved = unsafe { sigaction(Signal::SIGCHLD, &action) }
            .map_err(|e| SupervisorError::environment("unable to intercept SIGCHLD", e))?;
        monitor.saved_sigchld = Some(saved);

        tracing::debug!(ancestor = ?ancestor, "self-pipe monitor armed");
        Ok(monitor)
    }

    fn ancestor_exited(&self) -> Option<Pid> {
        let pid = self.ancestor?;
        // A dead parent lingers as a zombie, but we are reparented at once.
        if self.ancestor_is_parent && getppid() != pid {
            return Some(pid);
        }
        match kill(pid, None) {
            Err(Errno::ESRCH) => Some(pid),
            _ => None,
        }
    }

    /// Empty the pipe, reporting whether a `SIGCHLD` byte was seen.
    fn drain(&self) -> Result<bool, SupervisorError> {
        let mut child = false;
        let mut buf = [0u8; 64];
        loop {
            match read(self.read_end.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => child |= buf[..n].contains(&(Signal::SIGCHLD as i32 as u8)),
                Err(Errno::EINTR) => continue,
                Err(Errno::EAGAIN) => break,
                Err(e) => {
                    return Err(SupervisorError::environment("unable to read monitor pipe", e))
                }
            }
        }
        Ok(child)
    }

    fn timeout(&self) -> PollTimeout {
        if self.ancestor.is_none() {
            return PollTimeout::NONE;
        }
        i32::try_from(self.poll_interval.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX)
    }
}

impl ProcessMonitor for SelfPipeMonitor {
    fn name(&self) -> &str {
        "self-pipe"
    }

    fn wait(&mut self) -> Result<MonitorEvent, SupervisorError> {
        if let Some(pid) = self.ancestor_exited() {
            return Ok(MonitorEvent::AncestorExited(pid));
        }

        let timeout = self.timeout();
        let mut fds = [PollFd::new(self.read_end.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(SupervisorError::environment("unable to poll monitor pipe", e)),
        }

        let child = self.drain()?;

        if let Some(pid) = self.ancestor_exited() {
            return Ok(MonitorEvent::AncestorExited(pid));
        }
        Ok(if child {
            MonitorEvent::ChildSignaled
        } else {
            MonitorEvent::Interrupted
        })
    }
}

impl Drop for SelfPipeMonitor {
    fn drop(&mut self) {
        let _block = match SignalBlock::acquire() {
            Ok(block) => block,
            Err(e) => fatal("unable to block signals while disarming monitor", e),
        };
        if let Some(saved) = self.saved_sigchld.take() {
            // SAFETY: reinstates the disposition replaced in `new`.
            if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &saved) } {
                fatal("unable to restore SIGCHLD disposition", e);
            }
        }
        let _ = WAKE_FD.compare_exchange(
            self.write_end.as_raw_fd(),
            -1,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}
