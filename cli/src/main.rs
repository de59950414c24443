//! gbpctl
//!
//! Command-line front end for the group policy mapping engine.
//!
//! # Usage
//!
//! ```bash
//! gbpctl apply -f policy.yaml
//! gbpctl --format json apply -f policy.json
//! gbpctl config show
//! gbpctl config init
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod manifest;
mod output;

#[derive(Parser)]
#[command(name = "gbpctl")]
#[command(version)]
#[command(about = "Group policy mapping engine", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, short, env = "GBP_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    format: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply a policy manifest against an in-memory provider
    Apply {
        /// Manifest file (.yaml, .yml or .json)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Inspect engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the configuration file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config_path = config::config_path(cli.config.as_deref())?;

    match cli.command {
        Commands::Apply { file } => commands::apply::handle(&file, &config_path, cli.format).await,
        Commands::Config { action } => commands::config::handle(action, &config_path, cli.format),
    }
}
