/// Orphan teardown for a child whose designated ancestor has exited.
///
/// Sends SIGTERM (and SIGCONT, so stopped members can act on it) to the
/// child's process group, gives the group `grace` to exit, then SIGKILLs it
/// and reaps the child. When the child shares the supervisor's own process
/// group every signal goes to the child alone; the rest of that group
/// belongs to whoever started the supervisor.
use crate::clock;
use crate::error::SupervisorError;
use crate::launch::ChildProcess;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpgid, getpgrp, Pid};
use std::time::Duration;

const REAP_POLL: Duration = Duration::from_millis(10);

/// Whether the child has been reaped.
fn try_reap(child: &ChildProcess) -> Result<bool, SupervisorError> {
    loop {
        match waitpid(child.pid(), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return Ok(true),
            Ok(_) => return Ok(false),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return Ok(true),
            Err(e) => {
                return Err(SupervisorError::environment(
                    format!("unable to wait for child process {}", child.pid()),
                    e,
                ))
            }
        }
    }
}

/// Send `signal` to the child's group, or to the child alone when that group
/// is also ours.
fn signal_group(pid: Pid, pgid: Pid, shared: bool, signal: Signal) {
    let sent = if shared {
        kill(pid, signal)
    } else {
        killpg(pgid, signal)
    };
    if let Err(e) = sent {
        tracing::debug!(error = %e, %signal, %pid, %pgid, shared, "unable to signal orphan");
    }
}

pub fn abandon(child: &ChildProcess, grace: Duration) -> Result<(), SupervisorError> {
    let pid = child.pid();
    let pgid = getpgid(Some(pid)).unwrap_or(pid);
    let shared = pgid == getpgrp();

    if shared {
        tracing::warn!(
            %pid,
            program = child.program(),
            "ancestor exited, terminating child process"
        );
    } else {
        tracing::warn!(%pid, %pgid, "ancestor exited, terminating child process group");
    }
    for signal in [Signal::SIGTERM, Signal::SIGCONT] {
        signal_group(pid, pgid, shared, signal);
    }

    let deadline = clock::now().saturating_add(grace.as_millis() as u64);
    let mut reaped = try_reap(child)?;
    while !reaped && clock::now() < deadline {
        clock::sleep_until(REAP_POLL);
        reaped = try_reap(child)?;
    }

    // A reaped pid may already be reused; only the group outlives the child.
    if !shared || !reaped {
        signal_group(pid, pgid, shared, Signal::SIGKILL);
    }

    while !reaped {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                reaped = true
            }
            Ok(_) => continue,
            Err(e) => {
                return Err(SupervisorError::environment(
                    format!("unable to reap child process {pid}"),
                    e,
                ))
            }
        }
    }

    tracing::debug!(%pid, "orphaned child reaped");
    Ok(())
}
