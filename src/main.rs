use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod agent;
mod commands;
mod config;
mod error;
mod events;
mod logging;
mod pipeline;
mod platform;
mod pool;
mod sandbox;
mod sink;
mod templates;
mod usage;
mod workspace;

use config::{LoggingConfig, CONFIG_FILE};

#[derive(Parser)]
#[command(name = "phaserun")]
#[command(
    author,
    version,
    about = "Plan, work, evaluate - AI tasks on pooled dependencies in resource-limited sandboxes"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter phaserun.toml in the current directory
    Init {
        /// Force overwrite existing files
        #[arg(short, long)]
        force: bool,
    },

    /// Load and validate a configuration
    Check {
        /// Configuration file
        #[arg(short, long, env = "PHASERUN_CONFIG", default_value = CONFIG_FILE)]
        config: PathBuf,
    },

    /// Run configured tasks
    Run {
        /// Configuration file
        #[arg(short, long, env = "PHASERUN_CONFIG", default_value = CONFIG_FILE)]
        config: PathBuf,

        /// Only run these task ids (repeatable; default: all)
        #[arg(short, long = "task", value_name = "ID")]
        tasks: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let _log = logging::init(&LoggingConfig::default(), cli.verbose)?;
            commands::init::run(force)?;
        }
        Commands::Check { config } => {
            let _log = logging::init(&LoggingConfig::default(), cli.verbose)?;
            commands::check::run(&config)?;
        }
        Commands::Run { config: path, tasks } => {
            let config = commands::load_config(&path)?;
            let _log = logging::init(&config.logging, cli.verbose)?;
            if !commands::run::run(config, &path, &tasks).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
