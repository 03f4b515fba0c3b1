//! Configuration parsing and validation.
//!
//! Meterstore configuration is loaded from TOML files with CLI overrides.
//! Every section is optional; missing keys take the defaults below.

use crate::store::coordinator::StoreOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest identifier pool a device may be given.
pub const MAX_POOL_SIZE: u32 = 1 << 20;

/// Top-level meterstore configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local node identity.
    #[serde(default)]
    pub node: NodeConfig,

    /// Store behavior.
    #[serde(default)]
    pub store: StoreConfig,

    /// Device dispatch.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Telemetry and logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Local node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's identifier, unique within the cluster.
    #[serde(default = "default_node_id")]
    pub node_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Identifier pool size for devices without published capabilities.
    #[serde(default = "default_max_ids")]
    pub default_max_ids: u32,

    /// Let callers choose meter identifiers.
    #[serde(default)]
    pub user_defined_index: bool,

    /// Purge a device's meters when it disconnects.
    #[serde(default)]
    pub purge_on_disconnect: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_max_ids: default_max_ids(),
            user_defined_index: false,
            purge_on_disconnect: false,
        }
    }
}

impl StoreConfig {
    /// Coordinator options for this configuration.
    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            default_max_ids: self.default_max_ids,
            user_defined_index: self.user_defined_index,
            purge_on_disconnect: self.purge_on_disconnect,
        }
    }
}

/// Device dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of dispatch worker lanes.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Treat the local node as master of every device not assigned elsewhere.
    #[serde(default = "default_master_by_default")]
    pub master_by_default: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            master_by_default: default_master_by_default(),
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Include span targets in log lines.
    #[serde(default = "default_log_targets")]
    pub log_targets: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_targets: default_log_targets(),
        }
    }
}

// Default value functions

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_max_ids() -> u32 {
    1024
}

fn default_workers() -> usize {
    4
}

fn default_master_by_default() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_targets() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| "failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize config")
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref node_id) = overrides.node_id {
            self.node.node_id = node_id.clone();
        }
        if let Some(workers) = overrides.workers {
            self.dispatch.workers = workers;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.validate_node()?;
        self.validate_store()?;
        self.validate_dispatch()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            anyhow::bail!("node.node_id must not be empty");
        }
        if self.node.node_id.chars().any(char::is_whitespace) {
            anyhow::bail!(
                "node.node_id must not contain whitespace, got: {:?}",
                self.node.node_id
            );
        }

        Ok(())
    }

    fn validate_store(&self) -> Result<()> {
        if self.store.default_max_ids == 0 {
            anyhow::bail!("store.default_max_ids must be > 0");
        }
        if self.store.default_max_ids > MAX_POOL_SIZE {
            anyhow::bail!(
                "store.default_max_ids ({}) cannot exceed {}",
                self.store.default_max_ids,
                MAX_POOL_SIZE
            );
        }
        Ok(())
    }

    fn validate_dispatch(&self) -> Result<()> {
        if self.dispatch.workers == 0 {
            anyhow::bail!("dispatch.workers must be > 0");
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            anyhow::bail!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels,
                self.telemetry.log_level
            );
        }
        Ok(())
    }
}

/// CLI override options that can be applied to configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override node identifier.
    pub node_id: Option<String>,
    /// Override dispatch worker count.
    pub workers: Option<usize>,
}
