mod analysis;
mod config;
mod engine;
mod equilibrium;
mod error;
mod fit;
mod history;
mod interp;
mod manager;
mod market;
mod model;
mod population;
mod solver;
mod stats;

use crate::manager::Manager;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    #[arg(long)]
    sim_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Create,

    Resume {
        #[arg(long)]
        run_idx: usize,
    },

    Analyze,

    Clean,
}

fn main() {
    env_logger::Builder::new()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    if let Err(error) = run_cli() {
        log::error!("{error:#?}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<()> {
    let args = Cli::parse();
    log::info!("{args:#?}");

    let mgr = Manager::new(args.sim_dir).context("failed to construct mgr")?;

    match args.command {
        Command::Create => {
            let status = mgr.run_search(None).context("failed to create run")?;
            log::info!("run finished with status {status:?}");
        }
        Command::Resume { run_idx } => {
            let status = mgr
                .run_search(Some(run_idx))
                .context("failed to resume run")?;
            log::info!("run finished with status {status:?}");
        }
        Command::Analyze => mgr.run_analysis().context("failed to run analysis")?,
        Command::Clean => mgr.clean_simulation().context("failed to clean simulation")?,
    }

    Ok(())
}
