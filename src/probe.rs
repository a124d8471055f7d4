//! Bounded post-launch window that classifies a hap's immediate fate.

use std::time::{Duration, Instant};

use crate::hap::Hap;

/// Default fast-failure timeout, in seconds, overridable by
/// `HAPLESS_FAILFAST_TIMEOUT`.
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(150);

pub fn failfast_timeout() -> Duration {
    std::env::var("HAPLESS_FAILFAST_TIMEOUT")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `rc` never appeared within the window: still running, presumed healthy.
    Healthy,
    /// `rc` appeared and was zero before the window closed.
    QuickSuccess,
    /// `rc` appeared and was nonzero before the window closed.
    QuickFailure,
}

pub struct FastFailureProbe {
    timeout: Duration,
}

impl FastFailureProbe {
    pub fn new(timeout: Duration) -> Self {
        FastFailureProbe { timeout }
    }

    /// Poll `hap`'s rc file until it appears or the window closes.
    pub fn run(&self, hap: &Hap) -> Outcome {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(rc) = hap.rc() {
                return if rc == 0 {
                    Outcome::QuickSuccess
                } else {
                    Outcome::QuickFailure
                };
            }
            if Instant::now() >= deadline {
                return match hap.rc() {
                    Some(0) => Outcome::QuickSuccess,
                    Some(_) => Outcome::QuickFailure,
                    None => Outcome::Healthy,
                };
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Seconds remaining until the deadline, rounded up, for progress display.
    pub fn remaining_secs(&self, started: Instant) -> u64 {
        let elapsed = started.elapsed();
        if elapsed >= self.timeout {
            0
        } else {
            (self.timeout - elapsed).as_secs_f64().ceil() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher;

    fn run_hap_with(tmp: &std::path::Path, cmd: &str) -> Hap {
        let hap = Hap::open(tmp.to_path_buf());
        hap.set_cmd(cmd).unwrap();
        hap.set_workdir(tmp).unwrap();
        hap
    }

    #[test]
    fn healthy_when_timeout_shorter_than_sleep() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = run_hap_with(tmp.path(), "sleep 2 && exit 0");
        // Run the launcher's supervise step in a background thread so the
        // probe can race the timeout against a still-running child.
        let hap_path = tmp.path().to_path_buf();
        std::thread::spawn(move || {
            let hap = Hap::open(hap_path);
            launcher::supervise_body(&hap);
        });
        let probe = FastFailureProbe::new(Duration::from_millis(300));
        assert_eq!(probe.run(&hap), Outcome::Healthy);
    }

    #[test]
    fn quick_success_when_command_exits_zero_before_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = run_hap_with(tmp.path(), "exit 0");
        launcher::supervise_body(&hap);
        let probe = FastFailureProbe::new(Duration::from_secs(5));
        assert_eq!(probe.run(&hap), Outcome::QuickSuccess);
    }

    #[test]
    fn quick_failure_when_command_exits_nonzero_before_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let hap = run_hap_with(tmp.path(), "exit 3");
        launcher::supervise_body(&hap);
        let probe = FastFailureProbe::new(Duration::from_secs(5));
        assert_eq!(probe.run(&hap), Outcome::QuickFailure);
    }

    #[test]
    fn failfast_timeout_env_override() {
        // SAFETY: test-only; no other test mutates HAPLESS_FAILFAST_TIMEOUT
        // concurrently.
        unsafe {
            std::env::set_var("HAPLESS_FAILFAST_TIMEOUT", "9");
        }
        let t = failfast_timeout();
        unsafe {
            std::env::remove_var("HAPLESS_FAILFAST_TIMEOUT");
        }
        assert_eq!(t, Duration::from_secs(9));
    }
}
