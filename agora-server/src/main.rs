#![cfg_attr(not(test), forbid(unsafe_code))]

//! Entry point for an Agora server instance.

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use shared::config::server::Config;
use std::path::PathBuf;

/// Agora caching and coordination server
#[derive(Parser)]
#[command(name = "agora-server")]
#[command(about = "Room cache, chat fan-out and edit locks for Agora", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Port for the health and metrics listener, e.g. `--port 8080`
        #[arg(long, short)]
        port: Option<u16>,

        /// Path to a YAML or JSON configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Print the resolved configuration and exit
    Config {
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads configuration and starts the server.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port)?;
    server::server::run(resolved).await
}

fn handle_config_command(config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, None)?;
    print!("{}", serde_yml::to_string(&resolved)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    match Cli::parse().command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
        Commands::Config { config } => handle_config_command(config),
    }
}
