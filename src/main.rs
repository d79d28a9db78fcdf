mod analysis;
mod churn;
mod commands;
mod config;
mod context;
mod correlator;
mod crawler;
mod dispatch;
mod input;
mod network;
mod peers;
mod ratelimit;
mod stats;
mod tracker;
mod types;
mod workers;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::commands::CommandResult;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Options of the measurement commands are `Key=value` pairs; `Help` lists them.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Connect to as many peers as possible and record connection statistics
    #[command(disable_help_flag = true)]
    Connect {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        options: Vec<String>,
    },

    /// Compare one DHT crawl with the snapshots taken after it
    #[command(disable_help_flag = true)]
    Analyze {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        options: Vec<String>,
    },

    /// Compare every crawl and calculate churn over all snapshots
    #[command(disable_help_flag = true)]
    AnalyzeAll {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        options: Vec<String>,
    },

    /// Print the peers of a DHT crawl file
    Vpinfo {
        file: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        options: Vec<String>,
    },

    /// Print per-column mean, median, min and max of a stats file
    Datstats { file: PathBuf },
}

async fn run_command(command: Command) -> CommandResult {
    match command {
        Command::Connect { options } => commands::connect::run(&options).await,
        Command::Analyze { options } => commands::analyze::run(&options),
        Command::AnalyzeAll { options } => commands::analyze_all::run(&options).await,
        Command::Vpinfo { file, options } => commands::vpinfo::run(&file, &options),
        Command::Datstats { file } => commands::datstats::run(&file),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let build = option_env!("GIT_COMMIT_HASH").unwrap_or("unknown");
    info!("peerwatch v{} ({})", env!("CARGO_PKG_VERSION"), build);

    if let Err(e) = run_command(args.command).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}
