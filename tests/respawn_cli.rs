use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

fn respawn(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_respawn"))
        .args(args)
        .output()
        .expect("failed to run respawn")
}

#[test]
fn test_success_exit_is_passed_through() {
    let out = respawn(&["--", "true"]);
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn test_crash_loop_exits_255() {
    let start = Instant::now();
    let out = respawn(&["--", "false"]);
    assert_eq!(out.status.code(), Some(255));
    assert!(start.elapsed() < Duration::from_secs(10));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("rapid attempts"), "stderr: {stderr}");
}

#[test]
fn test_additional_success_code() {
    let out = respawn(&["--exit", "7", "--", "sh", "-c", "exit 7"]);
    assert_eq!(out.status.code(), Some(7));
}

#[test]
fn test_exit_none_keeps_restarting_zero() {
    let out = respawn(&["--exit", "none", "--", "true"]);
    assert_eq!(out.status.code(), Some(255));
}

#[test]
fn test_missing_program_exits_255() {
    let out = respawn(&["--", "nonexistent-binary-xyz"]);
    assert_eq!(out.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("nonexistent-binary-xyz"), "stderr: {stderr}");
}

#[test]
fn test_child_signal_is_reraised() {
    let out = respawn(&["--", "sh", "-c", "kill -TERM $$"]);
    assert_eq!(out.status.code(), None);
    assert_eq!(out.status.signal(), Some(15));
}

#[test]
fn test_continue_resumes_stopped_child() {
    let out = respawn(&["--continue", "--", "sh", "-c", "kill -STOP $$; exit 0"]);
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn test_child_stdout_is_inherited() {
    let out = respawn(&["--", "echo", "hello"]);
    assert_eq!(out.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "hello\n");
}

#[test]
fn test_missing_command_is_usage_error() {
    let out = respawn(&[]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_invalid_exit_code_is_usage_error() {
    let out = respawn(&["--exit", "300", "--", "true"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_help_exits_zero() {
    let out = respawn(&["--help"]);
    assert_eq!(out.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&out.stdout).contains("--forever"));
}

#[test]
fn test_config_file_limits_crash_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("respawn.toml");
    std::fs::write(&path, "[restart]\ncrash_loop_limit = 2\n").unwrap();
    let out = respawn(&["--config", path.to_str().unwrap(), "--", "false"]);
    assert_eq!(out.status.code(), Some(255));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("after 2 rapid attempts"), "stderr: {stderr}");
}

/// Start respawn in a fresh process group so job-control stops are honoured
/// and nothing it signals can reach the test runner.
fn spawn_isolated(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_respawn"))
        .args(args)
        .process_group(0)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("failed to spawn respawn")
}

/// Wait for `child` to stop and resume it, returning the stop signal.
fn resume_after_stop(child: &Child) -> Signal {
    let pid = Pid::from_raw(child.id() as i32);
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(_, signal)) => {
                kill(pid, Signal::SIGCONT).unwrap();
                return signal;
            }
            Err(Errno::EINTR) => continue,
            other => panic!("respawn did not stop: {other:?}"),
        }
    }
}

#[test]
fn test_child_stop_stops_supervisor_until_continued() {
    let mut child = spawn_isolated(&["--", "sh", "-c", "kill -STOP $$; exit 0"]);
    assert_eq!(resume_after_stop(&child), Signal::SIGSTOP);
    assert_eq!(child.wait().unwrap().code(), Some(0));
}

#[test]
fn test_continue_does_not_convert_terminal_stops() {
    let mut child = spawn_isolated(&[
        "--continue",
        "--",
        "sh",
        "-c",
        "kill -TTIN $$; exit 0",
    ]);
    assert_eq!(resume_after_stop(&child), Signal::SIGTTIN);
    assert_eq!(child.wait().unwrap().code(), Some(0));
}

#[cfg(target_os = "linux")]
#[test]
fn test_parented_orphan_is_abandoned() {
    use nix::sys::prctl;
    use std::fs;

    // Orphans of the intermediate shell are reparented here, so the
    // supervisor's own status can still be collected.
    prctl::set_child_subreaper(true).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let pids = |name: &str| dir.path().join(name);
    let script = r#"
        sleep 30 &
        echo $! > "$DIR/bystander"
        "$RESPAWN" --parented -- sh -c 'echo $$ > "$DIR/child"; exec sleep 30' &
        echo $! > "$DIR/supervisor"
        sleep 1
    "#;
    let status = Command::new("sh")
        .args(["-c", script])
        .env("RESPAWN", env!("CARGO_BIN_EXE_respawn"))
        .env("DIR", dir.path())
        .process_group(0)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success());

    let read_pid = |name: &str| -> Pid {
        let text = fs::read_to_string(pids(name)).unwrap();
        Pid::from_raw(text.trim().parse().unwrap())
    };
    let supervisor = read_pid("supervisor");
    let bystander = read_pid("bystander");
    let child = read_pid("child");

    let start = Instant::now();
    let status = loop {
        match waitpid(supervisor, None) {
            Err(Errno::EINTR) => continue,
            other => break other.unwrap(),
        }
    };
    assert_eq!(status, WaitStatus::Exited(supervisor, 255));
    assert!(start.elapsed() < Duration::from_secs(10));

    assert_eq!(kill(child, None), Err(Errno::ESRCH), "child not reaped");
    assert_eq!(kill(bystander, None), Ok(()), "bystander was signalled");

    kill(bystander, Signal::SIGKILL).unwrap();
    waitpid(bystander, None).unwrap();
}
