//! `scout` binary entry point: parses CLI args, drives the Orchestrator,
//! and maps its outcome to a process exit code.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::error;

use scout::orchestrator::{self, RunOptions};

/// Design-space exploration driver for parallel compute workloads.
#[derive(Parser, Debug)]
#[command(name = "scout", version, about)]
struct Cli {
    /// Path to the Study Definition (JSON).
    config: PathBuf,

    /// Number of trials to run; overrides the default of 100.
    #[arg(long)]
    trials: Option<usize>,

    /// Overrides `search.random_seed` from the config.
    #[arg(long)]
    seed: Option<u64>,

    /// Append to an existing archive instead of creating a fresh one,
    /// re-seeding the optimizer from its prior rows.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Materialize and print one suggested assignment's build/runtime plan
    /// without building or running anything.
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    env_logger::init();
    match main_result() {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{}", err);
            process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &scout::error::ScoutError) -> i32 {
    use scout::error::ErrorCode;
    match err.code() {
        ErrorCode::ConfigError => 2,
        _ => 3,
    }
}

fn main_result() -> Result<i32, scout::error::ScoutError> {
    let cli = Cli::parse();

    let opts = RunOptions {
        trials: cli.trials.unwrap_or(orchestrator::DEFAULT_TRIALS),
        seed_override: cli.seed,
        resume: cli.resume,
        dry_run: cli.dry_run,
    };

    orchestrator::run(&cli.config, opts)?;
    Ok(0)
}
