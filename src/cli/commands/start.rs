//! Start command implementation.

use crate::core::config::{Config, ConfigOverrides};
use crate::core::runtime::Runtime;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

/// Start a single meterstore node.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// Override the node identifier.
    #[arg(long)]
    pub node_id: Option<String>,

    /// Override the number of dispatch workers.
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Initialize the tracing subscriber if the telemetry feature is enabled.
///
/// `RUST_LOG` wins over the configured level. Safe to call more than once.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str, with_target: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init();
}

/// No-op without the telemetry feature.
#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str, _with_target: bool) {}

/// Load the configuration file, falling back to defaults when it is absent.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config from {:?}", path)),
        None => Ok(Config::default()),
    }
}

/// Run the start command with the given config path.
pub async fn run_start_with_config(
    config_path: Option<&Path>,
    log_level: Option<String>,
    args: StartArgs,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    config.apply_overrides(&ConfigOverrides {
        log_level,
        node_id: args.node_id,
        workers: args.workers,
    });
    config.validate().context("invalid configuration after overrides")?;

    init_tracing(&config.telemetry.log_level, config.telemetry.log_targets);

    let mut runtime = Runtime::new(config)?;
    runtime.run().await
}
