//! Config command implementation.

use crate::core::config::Config;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate configuration file.
    Validate {
        /// Config file path.
        #[arg(short, long, default_value = "config/meterstore.toml")]
        config: PathBuf,
    },
    /// Print configuration with defaults filled in.
    Show {
        /// Config file path; defaults only when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs) -> Result<()> {
    match args.command {
        ConfigCommand::Validate { config } => validate_config(&config),
        ConfigCommand::Show { config, format } => show_config(config.as_deref(), &format),
    }
}

fn validate_config(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("Config file not found: {:?}", path);
    }

    let config = Config::from_file(path)?;
    println!("✓ Configuration is valid");
    println!("  node_id:            {}", config.node.node_id);
    println!("  default_max_ids:    {}", config.store.default_max_ids);
    println!("  user_defined_index: {}", config.store.user_defined_index);
    println!("  dispatch workers:   {}", config.dispatch.workers);
    Ok(())
}

fn show_config(path: Option<&Path>, format: &str) -> Result<()> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    println!("{}", render_config(&config, format)?);
    Ok(())
}

fn render_config(config: &Config, format: &str) -> Result<String> {
    match format {
        "json" => Ok(serde_json::to_string_pretty(config)?),
        "toml" => config.to_toml(),
        other => anyhow::bail!("unknown format {:?}, expected toml or json", other),
    }
}
