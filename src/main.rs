use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conduit::config::{ConduitConfig, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "conduit")]
#[command(version, about = "Route data through phased domain stages with approval gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Auto-approve every control point
    #[arg(long, global = true)]
    pub yes: bool,

    /// Directory holding conduit.toml (defaults to the current directory)
    #[arg(long, global = true)]
    pub config_dir: Option<PathBuf>,

    /// Log output format: pretty or json. Overrides conduit.toml.
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a JSON input file through the pipeline
    Run {
        /// Path to the input file (an object with a `records` array)
        input: PathBuf,

        /// Give up on the pipeline after this many seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Print the routing graph
    Routes,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default conduit.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = match cli.config_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let log_format = cli
        .log_format
        .as_deref()
        .map(str::parse::<LogFormat>)
        .transpose()?;

    match &cli.command {
        Commands::Config { command } => {
            cmd::cmd_config(&config_dir, command.clone())?;
        }
        Commands::Routes => {
            let config = ConduitConfig::with_cli_args(config_dir, cli.verbose, cli.yes, log_format)?;
            cmd::cmd_routes(&config);
        }
        Commands::Run { input, timeout } => {
            let config = ConduitConfig::with_cli_args(config_dir, cli.verbose, cli.yes, log_format)?;
            let _guard = conduit::logging::init(&config.toml.logging)?;
            cmd::cmd_run(&config, input, *timeout).await?;
        }
    }

    Ok(())
}
