/// Child creation with synchronous exec-failure reporting.
///
/// A close-on-exec pipe is created before forking. A successful exec closes
/// the child's write end, so the parent reads EOF; a failed exec writes the
/// errno into the pipe before exiting. The parent therefore learns, before
/// supervision starts, whether the program itself ever ran.
use crate::error::LaunchError;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc::{self, c_char, c_int, c_void};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, read, ForkResult, Pid};
use std::ffi::CString;
use std::mem::size_of;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;

/// A running child owned by one supervision loop. Invalid once reaped.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    program: String,
}

impl ChildProcess {
    #[cfg(test)]
    pub(crate) fn from_pid(pid: Pid, program: &str) -> Self {
        Self {
            pid,
            program: program.to_string(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Kills and reaps a forked child unless defused.
struct HalfStarted {
    pid: Option<Pid>,
}

impl HalfStarted {
    fn defuse(mut self) {
        self.pid = None;
    }
}

impl Drop for HalfStarted {
    fn drop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        tracing::debug!(%pid, "killing half-started child");
        let _ = kill(pid, Signal::SIGKILL);
        loop {
            match waitpid(pid, None) {
                Err(Errno::EINTR) => continue,
                _ => break,
            }
        }
    }
}

fn cloexec(fd: &OwnedFd) -> Result<(), LaunchError> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map(|_| ())
        .map_err(LaunchError::Pipe)
}

fn build_argv(command: &[String]) -> Result<Vec<CString>, LaunchError> {
    if command.is_empty() {
        return Err(LaunchError::Command("no command given".to_string()));
    }
    command
        .iter()
        .map(|arg| {
            CString::new(arg.as_bytes())
                .map_err(|_| LaunchError::Command(format!("argument {arg:?} contains a NUL byte")))
        })
        .collect()
}

/// Runs in the forked child. Only async-signal-safe calls are made.
fn exec_child(argv: &[*const c_char], notify: RawFd) -> ! {
    // The Rust runtime ignores SIGPIPE in this process; the program must not
    // inherit that. std::process::Command does the same reset.
    // SAFETY: signal(2) is async-signal-safe.
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };

    // SAFETY: argv is NUL-terminated and its strings outlive this call.
    unsafe { libc::execvp(argv[0], argv.as_ptr()) };

    let code: c_int = Errno::last_raw();
    let bytes = code.to_ne_bytes();
    let mut written = 0;
    while written < bytes.len() {
        // SAFETY: writes from a live stack buffer to the inherited pipe.
        let n = unsafe {
            libc::write(
                notify,
                bytes[written..].as_ptr() as *const c_void,
                bytes.len() - written,
            )
        };
        if n > 0 {
            written += n as usize;
        } else if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        } else {
            break;
        }
    }
    // SAFETY: _exit skips atexit handlers inherited from the parent.
    unsafe { libc::_exit(libc::EXIT_FAILURE) }
}

/// Read the exec notification: `Ok(None)` on EOF, `Ok(Some(errno))` on a full code.
fn read_notification(fd: &OwnedFd, pid: Pid) -> Result<Option<Errno>, LaunchError> {
    let mut buf = [0u8; size_of::<c_int>()];
    let mut filled = 0;
    while filled < buf.len() {
        match read(fd.as_raw_fd(), &mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                return Err(LaunchError::Handshake {
                    pid: pid.as_raw(),
                    errno,
                })
            }
        }
    }
    match filled {
        0 => Ok(None),
        n if n == buf.len() => Ok(Some(Errno::from_raw(c_int::from_ne_bytes(buf)))),
        _ => Err(LaunchError::Handshake {
            pid: pid.as_raw(),
            errno: Errno::EIO,
        }),
    }
}

/// Fork and exec `command`, returning once the exec outcome is known.
///
/// On any failure the half-started child has been killed and reaped.
pub fn launch(command: &[String]) -> Result<ChildProcess, LaunchError> {
    let args = build_argv(command)?;
    let mut argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(ptr::null());

    let (notify_rd, notify_wr) = pipe().map_err(LaunchError::Pipe)?;
    cloexec(&notify_rd)?;
    cloexec(&notify_wr)?;

    // SAFETY: the child only calls async-signal-safe functions before exec or _exit.
    let pid = match unsafe { fork() }.map_err(LaunchError::Fork)? {
        ForkResult::Child => exec_child(&argv, notify_wr.as_raw_fd()),
        ForkResult::Parent { child } => child,
    };
    let guard = HalfStarted { pid: Some(pid) };
    tracing::debug!(%pid, "child process forked");

    drop(notify_wr);

    match read_notification(&notify_rd, pid)? {
        None => {
            guard.defuse();
            tracing::info!(%pid, program = %command[0], "child process started");
            Ok(ChildProcess {
                pid,
                program: command[0].clone(),
            })
        }
        Some(errno) => Err(LaunchError::Exec {
            program: command[0].clone(),
            errno,
        }),
    }
}
