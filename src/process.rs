//! Cross-platform process liveness, status, and process-tree helpers.
//!
//! `sysinfo` handles process enumeration/status/start-time; `libc`/`windows`
//! cover the low-level liveness probe and signal delivery that `sysinfo`
//! itself does not provide.

use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, RefreshKind, System};

/// Observable status of a live process, collapsed to the two buckets the
/// Hap status machine distinguishes: suspended, or anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Other,
}

/// A live process snapshot, enough to drive the Hap status derivation and
/// its PID-reuse guard.
#[derive(Debug, Clone, Copy)]
pub struct ProcInfo {
    pub pid: u32,
    pub state: RunState,
    /// Seconds since the Unix epoch the process started, per `sysinfo`.
    pub start_time: u64,
}

fn refresh_kind() -> RefreshKind {
    RefreshKind::nothing().with_processes(ProcessRefreshKind::everything())
}

/// Look up a process by pid. Returns `None` if no such process exists.
pub fn lookup(pid: u32) -> Option<ProcInfo> {
    let sys = System::new_with_specifics(refresh_kind());
    let proc = sys.process(Pid::from_u32(pid))?;
    let state = match proc.status() {
        ProcessStatus::Stop => RunState::Stopped,
        _ => RunState::Other,
    };
    Some(ProcInfo {
        pid,
        state,
        start_time: proc.start_time(),
    })
}

/// Cheap liveness probe without building a full process status.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
pub fn is_alive(pid: u32) -> bool {
    lookup(pid).is_some()
}

/// Direct children of `pid`, per the process table at the moment of the call.
pub fn children_of(pid: u32) -> Vec<u32> {
    let sys = System::new_with_specifics(refresh_kind());
    sys.processes()
        .values()
        .filter(|p| p.parent().map(|parent| parent.as_u32()) == Some(pid))
        .map(|p| p.pid().as_u32())
        .collect()
}

/// Full descendant set of `pid` (breadth-first, excludes `pid` itself).
pub fn descendants_of(pid: u32) -> Vec<u32> {
    let sys = System::new_with_specifics(refresh_kind());
    let mut entries: Vec<(u32, u32)> = Vec::new();
    for p in sys.processes().values() {
        if let Some(parent) = p.parent() {
            entries.push((p.pid().as_u32(), parent.as_u32()));
        }
    }

    let mut frontier = vec![pid];
    let mut descendants = Vec::new();
    let mut i = 0;
    while i < frontier.len() {
        let parent = frontier[i];
        for &(child, child_parent) in &entries {
            if child_parent == parent && !frontier.contains(&child) {
                frontier.push(child);
                descendants.push(child);
            }
        }
        i += 1;
    }
    descendants
}

/// Send an integer signal to a single pid. `ESRCH` (process already gone) is
/// treated as success, matching the "tolerate already-gone" policy.
#[cfg(unix)]
pub fn send_signal(pid: u32, signum: i32) -> std::io::Result<()> {
    // SAFETY: kill(2) accepts any pid/signum; we inspect errno afterwards.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(windows)]
pub fn send_signal(pid: u32, signum: i32) -> std::io::Result<()> {
    use windows::Win32::Foundation::CloseHandle;
    use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

    // Windows has no general signal-delivery facility for foreign processes;
    // any of TERM/INT/KILL is treated as a termination request.
    let _ = signum;
    unsafe {
        let handle = match OpenProcess(PROCESS_TERMINATE, false, pid) {
            Ok(h) => h,
            Err(_) => return Ok(()), // already gone
        };
        let result = TerminateProcess(handle, 1);
        let _ = CloseHandle(handle);
        result.map_err(|e| std::io::Error::other(e.to_string()))
    }
}

/// Stop (suspend) a process. Unix only — Windows has no equivalent.
#[cfg(unix)]
pub fn stop(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGSTOP)
}

/// Resume a previously stopped process. Unix only.
#[cfg(unix)]
pub fn cont(pid: u32) -> std::io::Result<()> {
    send_signal(pid, libc::SIGCONT)
}

/// Kill an entire process tree rooted at `pid`: descendants first, then the
/// root, tolerating processes that are already gone at each step. Killing
/// descendants before the parent shrinks the zombie window.
pub fn kill_tree(pid: u32) {
    let descendants = descendants_of(pid);
    for child in descendants.into_iter().rev() {
        let _ = send_signal(child, kill_signal());
    }
    let _ = send_signal(pid, kill_signal());
}

#[cfg(unix)]
fn kill_signal() -> i32 {
    libc::SIGKILL
}

#[cfg(windows)]
fn kill_signal() -> i32 {
    9
}
