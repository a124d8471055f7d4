//! hapless v0.1 — entry point.
//!
//! Human/JSON output goes to stdout; tracing logs always go to stderr so the
//! two never interleave in a way a script parsing stdout would choke on.

use anyhow::{anyhow, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hapless::errors::HaplessError;
use hapless::format::{self, HapView};
use hapless::hap::Hap;
use hapless::probe::Outcome;
use hapless::statedir::StateDir;
use hapless::supervisor::Supervisor;

#[derive(Debug, Parser)]
#[command(name = "hapless")]
#[command(about = "Tiny background process manager", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv); logs always go to stderr.
    #[arg(short = 'v', long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit machine-readable JSON instead of plain text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show status of all haps, or one if given (alias: show).
    Status { hap: Option<String> },
    /// Alias of `status`.
    Show { hap: Option<String> },

    /// Dump or follow a hap's stdout (or stderr with -e).
    Logs {
        hap: String,
        #[arg(short = 'f', long)]
        follow: bool,
        #[arg(short = 'e', long)]
        stderr: bool,
    },

    /// Alias of `logs -e`.
    Errors {
        hap: String,
        #[arg(short = 'f', long)]
        follow: bool,
    },

    /// Create and launch a detached command.
    Run {
        #[arg(short = 'n', long)]
        name: Option<String>,
        #[arg(long)]
        check: bool,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Suspend a running hap.
    Pause { hap: String },
    /// Resume a paused hap.
    Resume { hap: String },

    /// Kill one hap, or all active haps with -a.
    Kill {
        hap: Option<String>,
        #[arg(short = 'a', long = "all")]
        all: bool,
    },

    /// Send an arbitrary signal number to an active hap.
    Signal { hap: String, code: i32 },

    /// Remove finished haps.
    Clean {
        #[arg(short = 'a', long = "all")]
        all: bool,
    },

    /// Equivalent to `clean --all`.
    Cleanall,

    /// Kill, remove, and relaunch a hap under the same id.
    Restart { hap: String },

    /// Change a hap's base name, preserving its restart counter.
    Rename { hap: String, new_name: String },
}

fn main() {
    let cli = Cli::parse();

    let debug_env = std::env::var("HAPLESS_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let default_level = if debug_env || cli.verbose >= 2 {
        "debug"
    } else if cli.verbose == 1 {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run(cli) {
        if let Some(herr) = e.downcast_ref::<HaplessError>() {
            eprintln!("\u{1f9f2} {herr}");
            std::process::exit(herr.exit_code());
        }
        eprintln!("\u{1f9f2} {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let root = hapless::statedir::resolve_root();
    let state_dir = StateDir::init(root).map_err(|e| anyhow!(e))?;
    let sup = Supervisor::new(state_dir);
    let json = cli.json;

    match cli.command {
        None => cmd_status(&sup, None, json, cli.verbose > 0),
        Some(Command::Status { hap }) | Some(Command::Show { hap }) => {
            cmd_status(&sup, hap, json, cli.verbose > 0)
        }

        Some(Command::Logs { hap, follow, stderr }) => {
            let hap = sup.find(&hap).map_err(|e| anyhow!(e))?;
            sup.logs(&hap, stderr, follow)
        }
        Some(Command::Errors { hap, follow }) => {
            let hap = sup.find(&hap).map_err(|e| anyhow!(e))?;
            sup.logs(&hap, true, follow)
        }

        Some(Command::Run { name, check, command }) => cmd_run(&sup, name, check, command),

        Some(Command::Pause { hap }) => {
            let hap = sup.get_or_error(&hap).map_err(|e| anyhow!(e))?;
            sup.pause(&hap).map_err(|e| anyhow!(e))?;
            println!("\u{1f9f2} Paused {}", hap.name());
            Ok(())
        }
        Some(Command::Resume { hap }) => {
            let hap = sup.get_or_error(&hap).map_err(|e| anyhow!(e))?;
            sup.resume(&hap).map_err(|e| anyhow!(e))?;
            println!("\u{1f9f2} Resumed {}", hap.name());
            Ok(())
        }

        Some(Command::Kill { hap, all }) => cmd_kill(&sup, hap, all),

        Some(Command::Signal { hap, code }) => {
            if !hapless::supervisor::is_valid_signal(code) {
                return Err(anyhow!(HaplessError::InvalidSignal(code)));
            }
            let hap = sup.get_or_error(&hap).map_err(|e| anyhow!(e))?;
            sup.signal(&hap, code).map_err(|e| anyhow!(e))?;
            Ok(())
        }

        Some(Command::Clean { all }) => cmd_clean(&sup, all),
        Some(Command::Cleanall) => cmd_clean(&sup, true),

        Some(Command::Restart { hap }) => {
            let hap = sup.get_or_error(&hap).map_err(|e| anyhow!(e))?;
            let restarted = sup.restart(&hap)?;
            println!(
                "\u{1f9f2} Restarted hap #{} as {}",
                restarted.hid(),
                restarted.raw_name().unwrap_or_else(|| restarted.name())
            );
            Ok(())
        }

        Some(Command::Rename { hap, new_name }) => {
            let hap = sup.get_or_error(&hap).map_err(|e| anyhow!(e))?;
            sup.rename(&hap, &new_name).map_err(|e| anyhow!(e))?;
            println!("\u{1f9f2} Renamed hap #{} to {new_name}", hap.hid());
            Ok(())
        }
    }
}

fn cmd_status(sup: &Supervisor, hap: Option<String>, json: bool, verbose: bool) -> Result<()> {
    match hap {
        Some(alias) => {
            let hap = sup.find(&alias).map_err(|e| anyhow!(e))?;
            let view = HapView::capture(&hap, verbose);
            if json {
                format::print_one_json(&view);
            } else {
                format::print_one(&view, verbose);
            }
        }
        None => {
            let haps: Vec<Hap> = sup.haps();
            let views: Vec<HapView> = haps.iter().map(|h| HapView::capture(h, verbose)).collect();
            if json {
                format::print_list_json(&views);
            } else {
                format::print_list(&views, verbose);
            }
        }
    }
    Ok(())
}

fn cmd_run(sup: &Supervisor, name: Option<String>, check: bool, command: Vec<String>) -> Result<()> {
    if command.is_empty() {
        return Err(anyhow!(HaplessError::EmptyCommand));
    }
    let cmd = command.join(" ");
    let redirect_stderr = sup.default_redirect_stderr();

    let hap = sup
        .create(&cmd, name.as_deref(), None, None, 0, redirect_stderr)
        .map_err(|e| anyhow!(e))?;
    println!("\u{1f9f2} Launching hap #{} ({cmd})", hap.hid());

    match sup.run(&hap, check, false)? {
        None => {}
        Some(Outcome::Healthy) => {
            let timeout = hapless::probe::failfast_timeout().as_secs();
            println!("healthy and still running after {timeout} seconds");
        }
        Some(Outcome::QuickSuccess) => {
            let timeout = hapless::probe::failfast_timeout().as_secs();
            println!("finished successfully in <{timeout} seconds");
        }
        Some(Outcome::QuickFailure) => {
            eprintln!("exited too quickly. stderr:");
            if let Ok(contents) = std::fs::read_to_string(hap.stderr_path()) {
                eprint!("{contents}");
            }
            std::process::exit(1);
        }
    }
    Ok(())
}

fn cmd_kill(sup: &Supervisor, hap: Option<String>, all: bool) -> Result<()> {
    if hap.is_some() && all {
        eprintln!("\u{1f9f2} Specify either a hap or -a/--all, not both");
        std::process::exit(2);
    }

    let targets: Vec<Hap> = if all {
        sup.haps()
    } else if let Some(alias) = hap {
        vec![sup.get_or_error(&alias).map_err(|e| anyhow!(e))?]
    } else {
        sup.haps()
    };

    let killed = sup.kill(&targets);
    if killed > 0 {
        println!("\u{1f480} Killed {killed} active haps");
    } else {
        println!("\u{1f9f2} No active haps to kill");
    }
    Ok(())
}

fn cmd_clean(sup: &Supervisor, all: bool) -> Result<()> {
    let removed = sup.clean(all);
    if removed > 0 {
        println!("\u{1f9f2} Deleted {removed} finished haps");
    } else {
        println!("\u{1f9f2} Nothing to clean");
    }
    Ok(())
}
