//! hapless — a stateless background-process supervisor for a single
//! workstation.
//!
//! Provides the on-disk state-directory model, the per-job (hap) status
//! machine, the detached-spawn launcher, the fast-failure probe, the
//! high-level supervisor operations, and the plain-text/JSON formatter.
pub mod errors;
pub mod format;
pub mod hap;
pub mod launcher;
pub mod probe;
pub mod process;
pub mod statedir;
pub mod supervisor;
