//! `hapwrap` — Launcher Variant B's detached wrapper.
//!
//! Spawned as a new, detached session by `launcher::spawn_wrapper` on
//! platforms where `fork` is unavailable or forcibly disabled. Re-opens the
//! hap named by its single argument, asserts it is still `UNBOUND`, and
//! supervises it exactly the way the forked child does in Variant A.

use hapless::hap::{Hap, Status};
use hapless::statedir;

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let hid = match std::env::args().nth(1) {
        Some(hid) => hid,
        None => {
            eprintln!("hapwrap: missing hap id argument");
            std::process::exit(1);
        }
    };

    let root = statedir::resolve_root();
    let hap_path = root.join(&hid);
    let hap = Hap::open(hap_path);

    if hap.status() != Status::Unbound {
        eprintln!(
            "hapwrap: hap {hid} has to be unbound, found instead {}",
            hap.status().as_str()
        );
        std::process::exit(1);
    }

    hapless::launcher::supervise_body(&hap);
}
