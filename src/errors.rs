//! Typed error kinds for hapless.
//!
//! Each failure kind gets its own variant with a fixed message and exit-code
//! mapping; `main` downcasts the top-level `anyhow::Error` to `HaplessError`
//! to pick an exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HaplessError {
    #[error("No such hap: {0}")]
    NoSuchHap(String),

    #[error("Cannot manage hap launched by another user. Owner: {0}")]
    NotAccessible(String),

    #[error("Hap with such name already exists: {0}")]
    NameCollision(String),

    #[error("Cannot pause. Hap {0} is not running")]
    NotRunning(String),

    #[error("Cannot resume. Hap {0} is not suspended")]
    NotPaused(String),

    #[error("Workdir should be a path to existing directory")]
    InvalidWorkdir,

    #[error("{0} is not a valid signal code")]
    InvalidSignal(i32),

    #[error("You have to provide a command to run")]
    EmptyCommand,

    #[error("State directory {0} is not accessible by user {1}")]
    StateInaccessible(String, String),

    #[error("hap {0} bind failed: pid {1} vanished before it could be recorded")]
    BindFailed(String, u32),

    /// There is no portable SIGSTOP/SIGCONT equivalent for an arbitrary
    /// foreign process on Windows.
    #[error("{0} is not supported on this platform")]
    PlatformUnsupported(&'static str),

    /// A process-control syscall failed for a reason other than "already
    /// gone" (which callers already tolerate).
    #[error("{0}")]
    ProcessControl(String),
}

impl HaplessError {
    /// Usage errors exit 2, everything else (including `EmptyCommand`) exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            HaplessError::InvalidSignal(_) => 2,
            _ => 1,
        }
    }
}
