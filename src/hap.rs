//! Hap: a thin adapter over a single job's on-disk directory.
//!
//! All reads are best-effort: a missing field file degrades to "unknown"
//! (`None`) rather than failing, so a half-written hap (or one whose
//! launcher crashed) is still observable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local, TimeZone};

use crate::errors::HaplessError;
use crate::process::{self, RunState};

/// PID-reuse guard tolerance.
const PID_REUSE_EPSILON_SECS: i64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Unbound,
    Running,
    Paused,
    Success,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Unbound => "UNBOUND",
            Status::Running => "RUNNING",
            Status::Paused => "PAUSED",
            Status::Success => "SUCCESS",
            Status::Failed => "FAILED",
        }
    }
}

pub struct Hap {
    path: PathBuf,
    hid: String,
}

impl Hap {
    pub fn open(path: PathBuf) -> Self {
        let hid = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Hap { path, hid }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn hid(&self) -> &str {
        &self.hid
    }

    fn field(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn name_path(&self) -> PathBuf {
        self.field("name")
    }
    pub fn cmd_path(&self) -> PathBuf {
        self.field("cmd")
    }
    pub fn workdir_path(&self) -> PathBuf {
        self.field("workdir")
    }
    pub fn env_path(&self) -> PathBuf {
        self.field("env")
    }
    pub fn pid_path(&self) -> PathBuf {
        self.field("pid")
    }
    pub fn rc_path(&self) -> PathBuf {
        self.field("rc")
    }
    pub fn stdout_path(&self) -> PathBuf {
        self.field("stdout.log")
    }
    pub fn stderr_path(&self) -> PathBuf {
        self.field("stderr.log")
    }

    // ---------------- reads ----------------

    /// Raw on-disk name: `<base>` or `<base>@<restarts>`.
    pub fn raw_name(&self) -> Option<String> {
        std::fs::read_to_string(self.name_path())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// User-visible base name (the portion before `@`).
    pub fn name(&self) -> String {
        match self.raw_name() {
            Some(raw) => raw.split('@').next().unwrap_or(&raw).to_string(),
            None => self.hid.clone(),
        }
    }

    /// Restart counter, encoded as a `@n` suffix; 0 when absent.
    pub fn restarts(&self) -> u32 {
        self.raw_name()
            .and_then(|raw| raw.split_once('@').map(|(_, n)| n.to_string()))
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn cmd(&self) -> Option<String> {
        std::fs::read_to_string(self.cmd_path()).ok()
    }

    pub fn workdir(&self) -> Option<PathBuf> {
        std::fs::read_to_string(self.workdir_path())
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }

    pub fn pid(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn rc(&self) -> Option<i32> {
        std::fs::read_to_string(self.rc_path())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Whether stderr is merged into stdout.log. Locked at creation time by
    /// the presence of a pre-created, empty `stderr.log` sentinel.
    pub fn redirect_stderr(&self) -> bool {
        !self.stderr_path().exists()
    }

    /// Live process info behind the recorded pid, after the PID-reuse guard:
    /// the recorded `pid_file` mtime and the live process's reported start
    /// time must agree within a small epsilon, or the match is discarded as
    /// a stale PID-reuse collision.
    fn live_proc(&self, pid: u32) -> Option<process::ProcInfo> {
        let info = process::lookup(pid)?;
        let pid_mtime = mtime_epoch(&self.pid_path())?;
        let diff = (pid_mtime as i64) - (info.start_time as i64);
        if diff.abs() > PID_REUSE_EPSILON_SECS {
            return None;
        }
        Some(info)
    }

    /// Status derivation: a pure function of pid/rc presence and whether
    /// the process behind `pid` is actually still alive.
    pub fn status(&self) -> Status {
        let pid = self.pid();
        let rc = self.rc();

        if let Some(code) = rc {
            return if code == 0 {
                Status::Success
            } else {
                Status::Failed
            };
        }

        match pid {
            None => Status::Unbound,
            Some(pid) => match self.live_proc(pid) {
                None => Status::Failed,
                Some(info) => match info.state {
                    RunState::Stopped => Status::Paused,
                    RunState::Other => Status::Running,
                },
            },
        }
    }

    pub fn active(&self) -> bool {
        matches!(self.status(), Status::Running | Status::Paused)
    }

    /// Runtime in seconds: wall-clock since process start if active, else
    /// `mtime(rc) - mtime(pid)`. `None` means "a moment" (undefined) — e.g.
    /// a hap stuck bound with no rc and no live process.
    pub fn runtime_secs(&self) -> Option<i64> {
        if self.active() {
            let pid = self.pid()?;
            let info = self.live_proc(pid)?;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()?
                .as_secs();
            return Some(now as i64 - info.start_time as i64);
        }
        let start = mtime_epoch(&self.pid_path())?;
        let end = mtime_epoch(&self.rc_path())?;
        Some(end as i64 - start as i64)
    }

    pub fn start_time(&self) -> Option<DateTime<Local>> {
        mtime_epoch(&self.pid_path()).map(epoch_to_local)
    }

    pub fn end_time(&self) -> Option<DateTime<Local>> {
        mtime_epoch(&self.rc_path()).map(epoch_to_local)
    }

    /// Environment: the live process's environment if it is still running,
    /// else the recorded `env_file` snapshot taken right after bind.
    pub fn env(&self) -> Option<HashMap<String, String>> {
        if let Some(pid) = self.pid() {
            if self.live_proc(pid).is_some() {
                if let Some(live) = read_live_environ(pid) {
                    return Some(live);
                }
            }
        }
        let raw = std::fs::read_to_string(self.env_path()).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Owning user of the hap directory, or `"uid:gid"` if the UID cannot be
    /// resolved to a login name.
    #[cfg(unix)]
    pub fn owner(&self) -> String {
        use std::os::unix::fs::MetadataExt;
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return "unknown".to_string();
        };
        let uid = meta.uid();
        let gid = meta.gid();
        username_for_uid(uid).unwrap_or_else(|| format!("{uid}:{gid}"))
    }

    #[cfg(not(unix))]
    pub fn owner(&self) -> String {
        "unknown".to_string()
    }

    /// Whether the current user can mutate this hap.
    pub fn accessible(&self) -> bool {
        crate::statedir::StateDir::accessible(&self.path)
    }

    // ---------------- writes ----------------

    pub fn set_name(&self, raw: &str) -> std::io::Result<()> {
        std::fs::write(self.name_path(), raw)
    }

    pub fn set_cmd(&self, cmd: &str) -> std::io::Result<()> {
        std::fs::write(self.cmd_path(), cmd)
    }

    pub fn set_workdir(&self, workdir: &Path) -> std::io::Result<()> {
        std::fs::write(self.workdir_path(), workdir.display().to_string())
    }

    /// Write the pid file, then verify the pid is live: write-then-check so
    /// observers see the file even if the process died in the narrow window
    /// between write and check. The file is never rolled back.
    pub fn set_pid(&self, pid: u32) -> Result<(), HaplessError> {
        std::fs::write(self.pid_path(), pid.to_string())
            .map_err(|_| HaplessError::BindFailed(self.hid.clone(), pid))?;
        if !process::is_alive(pid) {
            return Err(HaplessError::BindFailed(self.hid.clone(), pid));
        }
        Ok(())
    }

    pub fn set_return_code(&self, rc: i32) -> std::io::Result<()> {
        std::fs::write(self.rc_path(), rc.to_string())
    }

    pub fn set_env(&self, env: &HashMap<String, String>) -> std::io::Result<()> {
        let json = serde_json::to_string(env).unwrap_or_default();
        std::fs::write(self.env_path(), json)
    }

    /// Pre-create an empty stderr.log at creation time when not redirecting,
    /// locking the redirection flag at creation time.
    pub fn ensure_stderr_log(&self) -> std::io::Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.stderr_path())?;
        Ok(())
    }
}

fn mtime_epoch(path: &Path) -> Option<u64> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    modified.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

fn epoch_to_local(secs: u64) -> DateTime<Local> {
    Local
        .timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Local::now)
}

#[cfg(target_os = "linux")]
fn read_live_environ(pid: u32) -> Option<HashMap<String, String>> {
    let raw = std::fs::read(format!("/proc/{pid}/environ")).ok()?;
    let mut map = HashMap::new();
    for entry in raw.split(|&b| b == 0) {
        if entry.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(entry);
        if let Some((k, v)) = text.split_once('=') {
            map.insert(k.to_string(), v.to_string());
        }
    }
    Some(map)
}

#[cfg(not(target_os = "linux"))]
fn read_live_environ(_pid: u32) -> Option<HashMap<String, String>> {
    None
}

#[cfg(unix)]
fn username_for_uid(uid: u32) -> Option<String> {
    use std::ffi::CStr;
    let mut buf = vec![0i8; 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: buf is valid for buf.len() bytes; pwd and result are
    // out-parameters filled in by getpwuid_r.
    let ret = unsafe {
        libc::getpwuid_r(
            uid,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if ret != 0 || result.is_null() {
        return None;
    }
    // SAFETY: pw_name is a valid NUL-terminated string owned by `buf`.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str().ok().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_and_restarts_split_raw_name() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_name("svc@3").unwrap();
        assert_eq!(hap.name(), "svc");
        assert_eq!(hap.restarts(), 3);
    }

    #[test]
    fn name_without_at_has_zero_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_name("svc").unwrap();
        assert_eq!(hap.name(), "svc");
        assert_eq!(hap.restarts(), 0);
    }

    #[test]
    fn status_is_unbound_with_no_pid_no_rc() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        assert_eq!(hap.status(), Status::Unbound);
        assert!(!hap.active());
    }

    #[test]
    fn status_is_success_when_rc_zero() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_return_code(0).unwrap();
        assert_eq!(hap.status(), Status::Success);
    }

    #[test]
    fn status_is_failed_when_rc_nonzero() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        hap.set_return_code(1).unwrap();
        assert_eq!(hap.status(), Status::Failed);
    }

    #[test]
    fn status_is_failed_when_pid_present_but_process_gone() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        // A pid that (almost certainly) does not exist and was never
        // recorded as alive by this test, simulating an orphaned launcher.
        std::fs::write(hap.pid_path(), "999999").unwrap();
        assert_eq!(hap.status(), Status::Failed);
    }

    #[test]
    fn redirect_stderr_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        // No stderr.log at all => redirected.
        assert!(hap.redirect_stderr());
        hap.ensure_stderr_log().unwrap();
        assert!(!hap.redirect_stderr());
    }

    #[test]
    fn set_pid_fails_for_dead_pid_but_still_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = Hap::open(tmp.path().to_path_buf());
        let result = hap.set_pid(999999);
        assert!(result.is_err());
        // Write-then-check: the file is left in place even on failure.
        assert!(hap.pid_path().exists());
    }
}
