//! Command-line interface.
//!
//! Unified CLI for meterstore operations.

pub mod commands;

use clap::{Parser, Subcommand};

/// Meterstore - replicated meter lifecycle store.
#[derive(Parser, Debug)]
#[command(name = "meterstore")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a single meterstore node.
    Start(commands::StartArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
    /// Run an install/remove round trip across simulated nodes.
    Simulate(commands::SimulateArgs),
}
