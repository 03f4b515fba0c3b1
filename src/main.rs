//! Meterstore - unified CLI entrypoint.
//!
//! Usage:
//!   meterstore start --config config/meterstore.toml
//!   meterstore config validate --config config/meterstore.toml
//!   meterstore config show --format json
//!   meterstore simulate --nodes 3 --devices 2 --meters 8

use anyhow::Result;
use clap::Parser;
use meterstore::cli::commands::{run_config, run_simulate, run_start_with_config};
use meterstore::cli::{Cli, Commands};
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "config/meterstore.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // An explicit --config must exist; the default path is optional.
    let config_path = match cli.config {
        Some(path) => Some(PathBuf::from(path)),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            default.exists().then_some(default)
        }
    };

    match cli.command {
        Commands::Start(args) => {
            run_start_with_config(config_path.as_deref(), cli.log_level, args).await
        }
        Commands::Config(args) => run_config(args),
        Commands::Simulate(args) => run_simulate(cli.log_level, args).await,
    }
}
