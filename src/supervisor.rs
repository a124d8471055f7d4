//! Supervisor: orchestrates create/run/pause/resume/kill/signal/restart/clean
//! across haps. Each method is a thin composition of `StateDir` + `Hap` +
//! `Launcher`.

use std::io::Read;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::errors::HaplessError;
use crate::hap::{Hap, Status};
use crate::launcher;
use crate::probe::{self, FastFailureProbe, Outcome};
use crate::process;
use crate::statedir::StateDir;

/// Lowest/highest signal numbers accepted by `signal`: range `[1, NSIG)`.
/// 64 comfortably covers both the 32 POSIX signals glibc exposes and the
/// handful of higher real-time signal numbers some platforms add.
pub const NSIG: i32 = 64;

pub fn is_valid_signal(code: i32) -> bool {
    (1..NSIG).contains(&code)
}

pub struct Supervisor {
    state_dir: StateDir,
    no_fork: bool,
    default_redirect_stderr: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

impl Supervisor {
    pub fn new(state_dir: StateDir) -> Self {
        let forced_no_fork = env_flag("HAPLESS_NO_FORK");
        Supervisor {
            state_dir,
            no_fork: forced_no_fork || cfg!(windows),
            default_redirect_stderr: env_flag("HAPLESS_REDIRECT_STDERR"),
        }
    }

    pub fn state_dir(&self) -> &StateDir {
        &self.state_dir
    }

    /// Default redirection flag for newly created haps, from
    /// `HAPLESS_REDIRECT_STDERR`, read once at construction.
    pub fn default_redirect_stderr(&self) -> bool {
        self.default_redirect_stderr
    }

    /// All haps, in ascending hid order.
    pub fn haps(&self) -> Vec<Hap> {
        self.state_dir
            .list_hap_ids()
            .into_iter()
            .map(|id| Hap::open(self.state_dir.hap_path(&id)))
            .collect()
    }

    fn base_name_taken(&self, base: &str, excluding_hid: Option<&str>) -> bool {
        self.haps()
            .iter()
            .filter(|h| excluding_hid != Some(h.hid()))
            .any(|h| h.name() == base)
    }

    /// Resolve an alias to a hap, without any access check.
    pub fn find(&self, alias: &str) -> Result<Hap, HaplessError> {
        self.state_dir
            .lookup(alias)
            .map(Hap::open)
            .ok_or_else(|| HaplessError::NoSuchHap(alias.to_string()))
    }

    /// Resolve an alias and reject it if the current user cannot manage it.
    /// Every mutating subcommand runs this before dispatch.
    pub fn get_or_error(&self, alias: &str) -> Result<Hap, HaplessError> {
        let hap = self.find(alias)?;
        if !hap.accessible() {
            return Err(HaplessError::NotAccessible(hap.owner()));
        }
        Ok(hap)
    }

    /// Create a new hap directory and persist `name`/`cmd`/`workdir`.
    ///
    /// `hid` is normally left `None` so the next sequential id is allocated;
    /// `restart` passes the old hap's id explicitly so identity survives the
    /// remove-and-recreate dance.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        cmd: &str,
        name: Option<&str>,
        hid: Option<String>,
        workdir: Option<PathBuf>,
        restarts: u32,
        redirect_stderr: bool,
    ) -> Result<Hap, HaplessError> {
        let hid = hid.unwrap_or_else(|| self.state_dir.next_id());
        let base = name.map(str::to_string).unwrap_or_else(|| hid.clone());
        if self.base_name_taken(&base, None) {
            return Err(HaplessError::NameCollision(base));
        }

        let workdir = workdir.unwrap_or_else(|| {
            std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
        });
        if !workdir.is_dir() {
            return Err(HaplessError::InvalidWorkdir);
        }

        let hap_path = self.state_dir.hap_path(&hid);
        let current_user = crate::statedir::current_username();
        std::fs::create_dir_all(&hap_path)
            .map_err(|_| HaplessError::StateInaccessible(hap_path.display().to_string(), current_user.clone()))?;

        let hap = Hap::open(hap_path);
        let raw_name = if restarts > 0 {
            format!("{base}@{restarts}")
        } else {
            base
        };
        let io_err = |_| HaplessError::StateInaccessible(hap.path().display().to_string(), current_user.clone());
        hap.set_name(&raw_name).map_err(io_err)?;
        hap.set_cmd(cmd).map_err(io_err)?;
        hap.set_workdir(&workdir).map_err(io_err)?;
        if !redirect_stderr {
            hap.ensure_stderr_log().map_err(io_err)?;
        }
        debug!(hid = hap.hid(), name = %raw_name, "created hap");
        Ok(hap)
    }

    /// Launch `hap` detached, optionally running the fast-failure probe.
    ///
    /// `blocking` inlines the supervise steps in the calling process instead
    /// of detaching — used by tests and by the `hapwrap` entry point, which
    /// is itself the detached process.
    pub fn run(&self, hap: &Hap, check: bool, blocking: bool) -> Result<Option<Outcome>> {
        if blocking {
            launcher::supervise_body(hap);
            return Ok(None);
        }
        launcher::launch(hap, self.state_dir.path(), self.no_fork)
            .with_context(|| format!("launching hap {}", hap.hid()))?;
        if check {
            let probe = FastFailureProbe::new(probe::failfast_timeout());
            return Ok(Some(probe.run(hap)));
        }
        Ok(None)
    }

    /// Suspend a running hap. Requires status `RUNNING`.
    pub fn pause(&self, hap: &Hap) -> Result<(), HaplessError> {
        if hap.status() != Status::Running {
            return Err(HaplessError::NotRunning(hap.name()));
        }
        let pid = hap.pid().ok_or_else(|| HaplessError::NotRunning(hap.name()))?;
        pause_process(pid)
    }

    /// Resume a paused hap. Requires status `PAUSED`.
    pub fn resume(&self, hap: &Hap) -> Result<(), HaplessError> {
        if hap.status() != Status::Paused {
            return Err(HaplessError::NotPaused(hap.name()));
        }
        let pid = hap.pid().ok_or_else(|| HaplessError::NotPaused(hap.name()))?;
        resume_process(pid)
    }

    /// Send an arbitrary signal to an active hap.
    pub fn signal(&self, hap: &Hap, code: i32) -> Result<(), HaplessError> {
        if !is_valid_signal(code) {
            return Err(HaplessError::InvalidSignal(code));
        }
        if !hap.active() {
            return Err(HaplessError::NotRunning(hap.name()));
        }
        let Some(pid) = hap.pid() else {
            return Err(HaplessError::NotRunning(hap.name()));
        };
        info!(hid = hap.hid(), pid, code, "sending signal");
        process::send_signal(pid, code)
            .map_err(|e| HaplessError::ProcessControl(format!("failed to signal pid {pid}: {e}")))
    }

    /// Kill every active hap's full descendant tree, best-effort. Returns the
    /// number of haps that were active (and thus signaled).
    pub fn kill(&self, haps: &[Hap]) -> usize {
        let mut killed = 0;
        for hap in haps {
            if hap.active() {
                if let Some(pid) = hap.pid() {
                    info!(hid = hap.hid(), pid, "killing hap tree");
                    process::kill_tree(pid);
                    killed += 1;
                }
            }
        }
        killed
    }

    /// Remove every hap whose status is `SUCCESS`, plus `FAILED` ones when
    /// `include_failed`. Active and unbound haps are never touched.
    pub fn clean(&self, include_failed: bool) -> usize {
        let mut removed = 0;
        for hap in self.haps() {
            let status = hap.status();
            let matches = status == Status::Success || (include_failed && status == Status::Failed);
            if matches {
                debug!(hid = hap.hid(), "cleaning hap");
                if std::fs::remove_dir_all(hap.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Rename a hap's base name, preserving its restart counter.
    pub fn rename(&self, hap: &Hap, new_base: &str) -> Result<(), HaplessError> {
        if self.base_name_taken(new_base, Some(hap.hid())) {
            return Err(HaplessError::NameCollision(new_base.to_string()));
        }
        let restarts = hap.restarts();
        let raw = if restarts > 0 {
            format!("{new_base}@{restarts}")
        } else {
            new_base.to_string()
        };
        hap.set_name(&raw)
            .map_err(|_| HaplessError::StateInaccessible(hap.path().display().to_string(), crate::statedir::current_username()))?;
        Ok(())
    }

    /// Kill (if active), remove, and relaunch `hap` under the same hid and
    /// working directory, with the restart counter incremented.
    ///
    /// The post-kill wait for `rc_file` is bounded to ~1s; on timeout the
    /// directory is removed anyway and progress continues (logged, not
    /// failed) — the child is presumed dead since `kill_tree` already sent
    /// `SIGKILL`.
    pub fn restart(&self, hap: &Hap) -> Result<Hap, anyhow::Error> {
        let hid = hap.hid().to_string();
        let name = hap.name();
        let cmd = hap.cmd().unwrap_or_default();
        let workdir = hap.workdir();
        let restarts = hap.restarts();
        let redirect_stderr = hap.redirect_stderr();

        if hap.active() {
            self.kill(std::slice::from_ref(hap));
            wait_inactive(hap, std::time::Duration::from_secs(1));
        }

        std::fs::remove_dir_all(hap.path())
            .with_context(|| format!("removing hap directory {}", hap.path().display()))?;

        let new_hap = self.create(
            &cmd,
            Some(&name),
            Some(hid),
            workdir,
            restarts + 1,
            redirect_stderr,
        )?;
        self.run(&new_hap, false, false)?;
        Ok(new_hap)
    }

    /// Dump or follow a hap's stdout/stderr log. Follow shells out to the
    /// host's `tail -f`; plain reads are a direct file read, keeping both
    /// paths on the same external-IO seam.
    pub fn logs(&self, hap: &Hap, stderr: bool, follow: bool) -> Result<()> {
        let path = if stderr { hap.stderr_path() } else { hap.stdout_path() };
        if follow {
            Command::new("tail")
                .arg("-f")
                .arg(&path)
                .status()
                .with_context(|| format!("tailing {}", path.display()))?;
            return Ok(());
        }

        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "log file does not exist yet");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("opening {}", path.display())),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        use std::io::Write;
        std::io::stdout().write_all(&buf)?;
        Ok(())
    }
}

#[cfg(unix)]
fn pause_process(pid: u32) -> Result<(), HaplessError> {
    process::stop(pid).map_err(|e| HaplessError::ProcessControl(format!("failed to pause pid {pid}: {e}")))
}

#[cfg(not(unix))]
fn pause_process(_pid: u32) -> Result<(), HaplessError> {
    Err(HaplessError::PlatformUnsupported("pause"))
}

#[cfg(unix)]
fn resume_process(pid: u32) -> Result<(), HaplessError> {
    process::cont(pid).map_err(|e| HaplessError::ProcessControl(format!("failed to resume pid {pid}: {e}")))
}

#[cfg(not(unix))]
fn resume_process(_pid: u32) -> Result<(), HaplessError> {
    Err(HaplessError::PlatformUnsupported("resume"))
}

/// Poll a fresh `Hap` view (never reuse a cached process handle across
/// iterations) until it is no longer active, or the bound elapses.
fn wait_inactive(hap: &Hap, bound: std::time::Duration) {
    let deadline = std::time::Instant::now() + bound;
    let path = hap.path().to_path_buf();
    loop {
        let fresh = Hap::open(path.clone());
        if !fresh.active() {
            return;
        }
        if std::time::Instant::now() >= deadline {
            warn!(hid = hap.hid(), "hap still active after bounded post-kill wait");
            return;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(tmp: &std::path::Path) -> Supervisor {
        let dir = StateDir::init(tmp.to_path_buf()).unwrap();
        Supervisor::new(dir)
    }

    #[test]
    fn create_allocates_sequential_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let h1 = sup.create("true", None, None, Some(tmp.path().to_path_buf()), 0, false).unwrap();
        let h2 = sup.create("true", None, None, Some(tmp.path().to_path_buf()), 0, false).unwrap();
        assert_eq!(h1.hid(), "1");
        assert_eq!(h2.hid(), "2");
    }

    #[test]
    fn create_rejects_name_collision() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.create("true", Some("foo"), None, Some(tmp.path().to_path_buf()), 0, false).unwrap();
        let err = sup
            .create("true", Some("foo"), None, Some(tmp.path().to_path_buf()), 0, false)
            .unwrap_err();
        assert!(matches!(err, HaplessError::NameCollision(_)));
    }

    #[test]
    fn create_rejects_missing_workdir() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let bogus = tmp.path().join("does-not-exist");
        let err = sup.create("true", None, None, Some(bogus), 0, false).unwrap_err();
        assert!(matches!(err, HaplessError::InvalidWorkdir));
    }

    #[test]
    fn run_blocking_executes_and_records_rc() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let hap = sup
            .create("exit 0", Some("foo"), None, Some(tmp.path().to_path_buf()), 0, true)
            .unwrap();
        sup.run(&hap, false, true).unwrap();
        assert_eq!(hap.status(), Status::Success);
    }

    #[test]
    fn clean_removes_only_success_unless_include_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let ok = sup.create("exit 0", Some("ok"), None, Some(tmp.path().to_path_buf()), 0, true).unwrap();
        let bad = sup.create("exit 1", Some("bad"), None, Some(tmp.path().to_path_buf()), 0, true).unwrap();
        sup.run(&ok, false, true).unwrap();
        sup.run(&bad, false, true).unwrap();

        let removed = sup.clean(false);
        assert_eq!(removed, 1);
        assert!(!ok.path().exists());
        assert!(bad.path().exists());

        let removed = sup.clean(true);
        assert_eq!(removed, 1);
        assert!(!bad.path().exists());
    }

    #[test]
    fn rename_preserves_restart_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let hap = sup
            .create("true", Some("svc"), None, Some(tmp.path().to_path_buf()), 2, false)
            .unwrap();
        sup.rename(&hap, "svc2").unwrap();
        assert_eq!(hap.raw_name().unwrap(), "svc2@2");
        assert_eq!(sup.find("svc").map(|h| h.hid().to_string()).ok(), None);
    }

    #[test]
    fn signal_rejects_out_of_range_code() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let hap = sup.create("sleep 5", Some("x"), None, Some(tmp.path().to_path_buf()), 0, false).unwrap();
        let err = sup.signal(&hap, 9999).unwrap_err();
        assert!(matches!(err, HaplessError::InvalidSignal(9999)));
    }
}
