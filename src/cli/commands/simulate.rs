//! Simulate command implementation.
//!
//! Spins up several runtimes sharing one in-memory cluster, spreads device
//! mastership across them, then installs and removes meters from rotating
//! nodes so that requests, device acks and completions cross node lines.

use crate::control::capabilities::DeviceCapabilities;
use crate::control::mastership::NodeId;
use crate::core::config::Config;
use crate::core::runtime::Runtime;
use crate::store::memory::InMemoryCluster;
use crate::store::pending::PendingOperation;
use crate::store::record::{AppId, DeviceId, MeterUnit, ResourceDescriptor, ResourceKey};
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::time::Duration;

/// Run an install/remove round trip across simulated nodes.
#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of cluster nodes.
    #[arg(long, default_value = "3")]
    pub nodes: usize,

    /// Number of devices; mastership is assigned round-robin.
    #[arg(long, default_value = "2")]
    pub devices: usize,

    /// Number of meters to install.
    #[arg(long, default_value = "8")]
    pub meters: usize,

    /// Meter table size advertised by every device.
    #[arg(long, default_value = "64")]
    pub max_meters: u32,

    /// Per-operation timeout in milliseconds.
    #[arg(long, default_value = "2000")]
    pub timeout_ms: u64,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Default for SimulateArgs {
    fn default() -> Self {
        Self {
            nodes: 3,
            devices: 2,
            meters: 8,
            max_meters: 64,
            timeout_ms: 2000,
            json: false,
        }
    }
}

/// Dispatch counters of one simulated node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    /// Node identifier.
    pub node_id: String,
    /// Device requests this node forwarded as master.
    pub forwarded: u64,
    /// Device requests this node skipped.
    pub skipped: u64,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    /// Installs that resolved successfully.
    pub installed: usize,
    /// Removals that resolved successfully.
    pub removed: usize,
    /// Operations that failed or timed out.
    pub failed: usize,
    /// Records left in the store after the run.
    pub remaining_records: usize,
    /// Per-node dispatch counters.
    pub nodes: Vec<NodeSummary>,
}

/// Run the simulate command.
pub async fn run_simulate(log_level: Option<String>, args: SimulateArgs) -> Result<()> {
    if let Some(level) = log_level.as_deref() {
        super::init_tracing(level, true);
    }

    let json = args.json;
    let summary = run_simulation(args).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Simulation");
        println!("  installed:         {}", summary.installed);
        println!("  removed:           {}", summary.removed);
        println!("  failed:            {}", summary.failed);
        println!("  remaining records: {}", summary.remaining_records);
        for node in &summary.nodes {
            println!(
                "  {:<10} forwarded={} skipped={}",
                node.node_id, node.forwarded, node.skipped
            );
        }
    }
    Ok(())
}

/// Run a simulation and collect its summary.
pub async fn run_simulation(args: SimulateArgs) -> Result<SimulationSummary> {
    if args.nodes == 0 || args.devices == 0 {
        anyhow::bail!("simulation needs at least one node and one device");
    }

    let cluster = InMemoryCluster::new();
    let mut runtimes = Vec::with_capacity(args.nodes);
    for n in 0..args.nodes {
        let mut config = Config::default();
        config.node.node_id = format!("node-{}", n + 1);
        config.dispatch.master_by_default = false;
        config.dispatch.workers = 2;

        let mut runtime = Runtime::with_cluster(config, cluster.clone())?;
        runtime.start().await?;
        runtimes.push(runtime);
    }

    let node_ids: Vec<NodeId> = runtimes.iter().map(|r| r.node_id().clone()).collect();
    let devices: Vec<DeviceId> = (0..args.devices)
        .map(|d| DeviceId::new(format!("device-{}", d + 1)))
        .collect();

    for (d, device) in devices.iter().enumerate() {
        let master = &node_ids[d % node_ids.len()];
        for runtime in &runtimes {
            runtime.mastership().set_master(device.clone(), master.clone());
        }
        coordinator_of(&runtimes[0])?
            .capabilities()
            .publish(DeviceCapabilities::new(device.clone(), args.max_meters))?;
    }

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut failed = 0;
    let mut installed = Vec::new();

    for m in 0..args.meters {
        let origin = &runtimes[m % runtimes.len()];
        let descriptor = ResourceDescriptor::new(
            devices[m % devices.len()].clone(),
            AppId::new("simulate"),
            MeterUnit::KbPerSec,
            1_000 * (m as u64 + 1),
        );
        match coordinator_of(origin)?.install(descriptor) {
            Ok(operation) => {
                let key = operation.key().clone();
                if settle(operation, timeout).await {
                    installed.push((m, key));
                } else {
                    failed += 1;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "install rejected");
                failed += 1;
            }
        }
    }

    let installed_count = installed.len();
    let mut removed = 0;
    for (m, key) in installed {
        // Remove from the next node over so completions move with the origin.
        let remover = &runtimes[(m + 1) % runtimes.len()];
        if settle(coordinator_of(remover)?.remove(&key), timeout).await {
            removed += 1;
        } else {
            failed += 1;
        }
    }

    let remaining_records = coordinator_of(&runtimes[0])?.list_all()?.len();
    let nodes = runtimes
        .iter()
        .map(|runtime| {
            let stats = runtime.dispatcher().map(|d| d.stats()).unwrap_or_default();
            NodeSummary {
                node_id: runtime.node_id().to_string(),
                forwarded: stats.forwarded,
                skipped: stats.skipped,
            }
        })
        .collect();

    for runtime in runtimes.iter_mut() {
        runtime.stop().await?;
    }

    Ok(SimulationSummary {
        installed: installed_count,
        removed,
        failed,
        remaining_records,
        nodes,
    })
}

fn coordinator_of(
    runtime: &Runtime,
) -> Result<&std::sync::Arc<crate::store::coordinator::LifecycleCoordinator>> {
    runtime
        .coordinator()
        .with_context(|| format!("node {} has no coordinator", runtime.node_id()))
}

async fn settle(operation: PendingOperation, timeout: Duration) -> bool {
    let key: ResourceKey = operation.key().clone();
    match tokio::time::timeout(timeout, operation).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::warn!(key = %key, error = %e, "operation failed");
            false
        }
        Err(_) => {
            tracing::warn!(key = %key, "operation timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulation_round_trip_leaves_store_empty() {
        let summary = run_simulation(SimulateArgs::default()).await.unwrap();

        assert_eq!(summary.installed, 8);
        assert_eq!(summary.removed, 8);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.remaining_records, 0);

        // Every request is seen by every node but forwarded exactly once.
        let forwarded: u64 = summary.nodes.iter().map(|n| n.forwarded).sum();
        assert_eq!(forwarded, 16);
    }

    #[tokio::test]
    async fn simulation_requires_nodes() {
        let args = SimulateArgs {
            nodes: 0,
            ..SimulateArgs::default()
        };
        assert!(run_simulation(args).await.is_err());
    }
}
