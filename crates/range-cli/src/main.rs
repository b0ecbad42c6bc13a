//! `rangectl`: offline operator tool for range agents

use anyhow::Result;
use clap::{Parser, Subcommand};
use lab_orchestration::StateBackend;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "rangectl")]
#[command(about = "Range agent operator tool")]
#[command(version)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Agent configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Saved registry snapshot commands
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Generate flags
    Flag {
        /// Number of flags
        #[arg(short, long, default_value_t = 1)]
        count: usize,

        /// Also print the masked hint form
        #[arg(short, long)]
        masked: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Parse and validate a configuration file
    Check {
        /// Configuration file path
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    /// Show environments, labs and exercises of a snapshot
    Show {
        /// State directory (platform data directory if unset)
        #[arg(long)]
        state_path: Option<PathBuf>,

        /// Storage backend
        #[arg(long, default_value_t = StateBackend::File)]
        backend: StateBackend,

        /// Output format (table or json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    smol::block_on(async {
        match cli.command {
            Commands::Config {
                command: ConfigCommands::Check { file },
            } => commands::config::check(&file),
            Commands::State {
                command:
                    StateCommands::Show {
                        state_path,
                        backend,
                        format,
                    },
            } => commands::state::show(state_path, backend, &format).await,
            Commands::Flag { count, masked } => commands::flag::run(count, masked),
        }
    })
}
