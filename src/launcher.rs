//! Detached-spawn protocol: turning a foreground `run` invocation into a
//! durable orphan child with a pid/rc record the next invocation can find.
//!
//! Two variants of equal correctness, chosen at launch time:
//!
//! - Variant A (Unix, default): `fork`, detach the child into its own
//!   session, then supervise the user command from inside that child.
//! - Variant B (Windows, or when forcibly disabled): spawn a small detached
//!   wrapper binary (`hapwrap`) that re-opens the hap and supervises from a
//!   freshly started process instead of a forked copy.
//!
//! Both variants funnel into the same `supervise_body`, so the steps after
//! detachment — open logs, spawn the shell, record pid/env, wait, record rc
//! — are written exactly once.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::Context;
use tracing::warn;

use crate::hap::Hap;

/// Resolve the shell used to interpret `cmd`, and the flag that introduces
/// an inline command string to that shell.
fn resolve_shell() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd.exe".to_string(), "/C")
    } else {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        (shell, "-c")
    }
}

#[cfg(unix)]
fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => -status.signal().unwrap_or(1),
    }
}

#[cfg(not(unix))]
fn exit_code_from_status(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Steps 3-5 of the detached-spawn protocol: spawn the user command, record
/// its pid and environment, wait for it, record the return code. Runs
/// in-process, after detachment has already happened (or, for blocking test
/// runs, directly in the caller).
pub fn supervise_body(hap: &Hap) {
    let workdir = hap.workdir().unwrap_or_else(|| PathBuf::from("."));
    let cmd = match hap.cmd() {
        Some(cmd) => cmd,
        None => {
            warn!(hid = hap.hid(), "hap has no recorded command, cannot supervise");
            let _ = hap.set_return_code(-1);
            return;
        }
    };
    let (shell, shell_flag) = resolve_shell();
    let redirect_stderr = hap.redirect_stderr();

    let stdout_file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(hap.stdout_path())
    {
        Ok(f) => f,
        Err(e) => {
            warn!(hid = hap.hid(), error = %e, "failed to open stdout.log");
            let _ = hap.set_return_code(-1);
            return;
        }
    };

    let stderr_stdio = if redirect_stderr {
        match stdout_file.try_clone() {
            Ok(dup) => Stdio::from(dup),
            Err(_) => Stdio::null(),
        }
    } else {
        if let Err(e) = hap.ensure_stderr_log() {
            warn!(hid = hap.hid(), error = %e, "failed to pre-create stderr.log");
        }
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(hap.stderr_path())
        {
            Ok(f) => Stdio::from(f),
            Err(_) => Stdio::null(),
        }
    };

    let mut command = Command::new(&shell);
    command
        .arg(shell_flag)
        .arg(&cmd)
        .current_dir(&workdir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::from(stdout_file))
        .stderr(stderr_stdio);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(hid = hap.hid(), error = %e, "failed to spawn command");
            let _ = hap.set_return_code(127);
            return;
        }
    };

    let pid = child.id();
    if let Err(e) = hap.set_pid(pid) {
        // BIND_FAILED: logged, non-fatal. The hap is left pid-bound but the
        // status machine will observe the dead pid and report FAILED.
        warn!(hid = hap.hid(), error = %e, "bind failed");
    }

    let env_snapshot: HashMap<String, String> = std::env::vars().collect();
    let _ = hap.set_env(&env_snapshot);

    let rc = match child.wait() {
        Ok(status) => exit_code_from_status(status),
        Err(_) => -1,
    };
    let _ = hap.set_return_code(rc);
}

/// Launch `hap` detached. Chooses Variant A on Unix unless `no_fork` is set
/// or fork is unavailable, else Variant B.
pub fn launch(hap: &Hap, state_dir_path: &Path, no_fork: bool) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        if !no_fork {
            return spawn_fork(hap.path());
        }
    }
    spawn_wrapper(hap.path(), state_dir_path)
}

/// Variant A: fork, detach the child into a new session, supervise in place.
///
/// The forked child never returns to the caller's call stack: it always
/// terminates via `_exit`, which skips Rust's normal unwind/cleanup path and
/// so is safe to call from a process that forked while other threads held
/// runtime locks.
#[cfg(unix)]
fn spawn_fork(hap_path: &Path) -> anyhow::Result<()> {
    let hap_path = hap_path.to_path_buf();
    // SAFETY: between fork and _exit the child only touches async-signal-safe
    // libc calls (setsid) and then normal single-threaded Rust code; it never
    // returns into the parent's call stack.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error()).context("fork failed");
    }
    if pid == 0 {
        // SAFETY: setsid is async-signal-safe and valid immediately after fork.
        unsafe {
            libc::setsid();
        }
        let hap = Hap::open(hap_path);
        supervise_body(&hap);
        // SAFETY: _exit bypasses atexit/Rust unwind handlers, required after
        // a fork in a multi-threaded process.
        unsafe {
            libc::_exit(0);
        }
    }
    Ok(())
}

/// Variant B: spawn the dedicated `hapwrap` wrapper binary as a new session
/// leader with null stdio, passing the hap id as its only argument.
fn spawn_wrapper(hap_path: &Path, state_dir_path: &Path) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolving current executable")?;
    let wrapper_name = if cfg!(windows) { "hapwrap.exe" } else { "hapwrap" };
    let wrapper_path = exe.with_file_name(wrapper_name);

    let hid = hap_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut command = Command::new(&wrapper_path);
    command
        .arg(&hid)
        .env("HAPLESS_DIR", state_dir_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // SAFETY: setsid is the only call made between fork and exec inside
        // the spawned wrapper's child, and is async-signal-safe.
        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const DETACHED_PROCESS: u32 = 0x0000_0008;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    }

    command
        .spawn()
        .with_context(|| format!("spawning wrapper at {}", wrapper_path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_shell_prefers_shell_env_on_unix() {
        if cfg!(unix) {
            // SAFETY: test-only env mutation, not run in parallel with other
            // SHELL-mutating tests.
            unsafe {
                std::env::set_var("SHELL", "/bin/zsh");
            }
            let (shell, flag) = resolve_shell();
            unsafe {
                std::env::remove_var("SHELL");
            }
            assert_eq!(shell, "/bin/zsh");
            assert_eq!(flag, "-c");
        }
    }

    #[test]
    fn supervise_body_runs_command_and_records_rc() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_cmd("exit 0").unwrap();
        hap.set_workdir(tmp.path()).unwrap();
        supervise_body(&hap);
        assert_eq!(hap.rc(), Some(0));
        assert!(hap.pid().is_some());
    }

    #[test]
    fn supervise_body_records_nonzero_rc() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_cmd("exit 7").unwrap();
        hap.set_workdir(tmp.path()).unwrap();
        supervise_body(&hap);
        assert_eq!(hap.rc(), Some(7));
    }

    #[test]
    fn supervise_body_writes_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_cmd("echo hi").unwrap();
        hap.set_workdir(tmp.path()).unwrap();
        supervise_body(&hap);
        let out = std::fs::read_to_string(hap.stdout_path()).unwrap();
        assert_eq!(out, "hi\n");
    }
}
