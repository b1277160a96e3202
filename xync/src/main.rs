//! xync - scheduled ZFS replication across local and SSH endpoints.
//!
//! The driver: parse the CLI, load configuration, wire the logging sinks,
//! take the snapshot lock, run the engine over every configured pair, and
//! print the summary. Termination signals release the locks and exit 128.

mod logging;
mod status;

use anyhow::{Result, bail};
use clap::Parser;
use clap::error::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::{error, info};
use xync_core::engine::RunStatus;
use xync_core::{Config, Engine, LockFile, RunReport, SystemExecutor};

/// Configuration or usage problem.
const EXIT_CONFIG: i32 = 1;
/// Lock held, stale lock, or terminated by signal.
const EXIT_FATAL: i32 = 128;

#[derive(Parser)]
#[command(
    name = "xync",
    version,
    about = "Replicate ZFS datasets to local or remote destinations",
    after_help = "Pairs are configured via REPLICATE_SETS as src[@host]:dst[@host] specs.\n\
                  A positional config file is accepted for compatibility with older installs."
)]
struct Cli {
    /// Configuration file (positional form)
    #[arg(value_name = "CONFIG")]
    config_positional: Option<PathBuf>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the last status line from the most recent log file and exit
    #[arg(short, long)]
    status: bool,

    /// Plan and probe, but create, destroy and send nothing
    #[arg(long)]
    dry_run: bool,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Enable debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_CONFIG,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    std::process::exit(run(cli));
}

#[tokio::main]
async fn run(cli: Cli) -> i32 {
    let config_file = match resolve_config_file(&cli) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("xync: {err}");
            return EXIT_CONFIG;
        }
    };

    if cli.status {
        return status::print_status(config_file.as_deref(), cli.json);
    }

    let cfg = match Config::load(config_file.as_deref()) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("xync: {err}");
            return EXIT_CONFIG;
        }
    };

    let _log_guard = match logging::init(&cfg, cli.verbose) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("xync: {err:#}");
            return EXIT_CONFIG;
        }
    };

    if let Err(err) = preflight(&cfg) {
        error!("{err:#}");
        return EXIT_CONFIG;
    }

    // Held for the whole run; the engine takes the send lock per transfer.
    let snapshot_lock = match LockFile::acquire(&cfg.lock_dir, "snapshot") {
        Ok(lock) => lock,
        Err(err) => {
            error!("{err}");
            return EXIT_FATAL;
        }
    };

    if cli.dry_run {
        info!("dry run: no snapshots will be created, destroyed or sent");
    }

    let exec = SystemExecutor::new();
    let engine = Engine::new(&cfg, &exec).with_dry_run(cli.dry_run);
    let report = Mutex::new(RunReport::default());

    let outcome = tokio::select! {
        result = engine.run(&report) => Some(result),
        _ = termination_signal() => None,
    };

    let report = report.lock().map(|r| *r).unwrap_or_default();
    drop(snapshot_lock);

    match outcome {
        Some(Ok(())) => {
            let status = report.status();
            info!("{}", report.summary(status));
            if cli.json {
                print_json(&report, status);
            }
            0
        }
        Some(Err(lock_err)) => {
            error!("{lock_err}");
            info!("{}", report.summary(RunStatus::Error));
            if cli.json {
                print_json(&report, RunStatus::Error);
            }
            EXIT_FATAL
        }
        None => {
            error!("operation exited unexpectedly");
            info!("{}", report.summary(RunStatus::Error));
            if cli.json {
                print_json(&report, RunStatus::Error);
            }
            EXIT_FATAL
        }
    }
}

/// `-c` wins; otherwise a readable positional file; otherwise `config.sh`
/// beside the binary when present; otherwise environment only.
fn resolve_config_file(cli: &Cli) -> Result<Option<PathBuf>, String> {
    if let Some(path) = &cli.config {
        return Ok(Some(path.clone()));
    }
    if let Some(path) = &cli.config_positional {
        if path.is_file() {
            return Ok(Some(path.clone()));
        }
        return Err(format!("{} is not a readable config file", path.display()));
    }
    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("config.sh")));
    match sibling {
        Some(path) if path.is_file() => Ok(Some(path)),
        _ => Ok(None),
    }
}

/// Fail fast when the external tools a run will need are missing.
fn preflight(cfg: &Config) -> Result<()> {
    if which::which("zfs").is_err() {
        bail!("zfs not found in PATH");
    }
    let needs_ssh = cfg.replicate_sets.iter().any(|spec| spec.contains('@'));
    if needs_ssh && which::which("ssh").is_err() {
        bail!("ssh not found in PATH but REPLICATE_SETS references remote hosts");
    }
    Ok(())
}

fn print_json(report: &RunReport, status: RunStatus) {
    println!(
        "{}",
        serde_json::json!({
            "status": status,
            "pairs": report.pairs,
            "pairs_skipped": report.pairs_skipped,
            "datasets": report.datasets,
            "datasets_skipped": report.datasets_skipped,
        })
    );
}

/// Resolves when SIGINT, SIGTERM or SIGQUIT arrives.
async fn termination_signal() {
    async fn recv(sig: Option<Signal>) {
        match sig {
            Some(mut sig) => {
                sig.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    tokio::select! {
        _ = recv(signal(SignalKind::interrupt()).ok()) => {}
        _ = recv(signal(SignalKind::terminate()).ok()) => {}
        _ = recv(signal(SignalKind::quit()).ok()) => {}
    }
}
