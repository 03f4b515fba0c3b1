//! Main runtime orchestration.
//!
//! The runtime coordinates component lifecycle:
//! - Start order: cluster membership → lifecycle coordinator → device dispatcher
//! - Shutdown order: device dispatcher → lifecycle coordinator → cluster membership

use crate::control::mastership::{MastershipService, NodeId, StaticMastership};
use crate::core::config::Config;
use crate::provider::{DeviceDispatcher, DeviceProvider, LoopbackProvider};
use crate::store::coordinator::LifecycleCoordinator;
use crate::store::map::ListenerId;
use crate::store::memory::{ClusterNode, InMemoryCluster};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Replicated map cluster health.
    pub cluster: ComponentHealth,
    /// Lifecycle coordinator health.
    pub coordinator: ComponentHealth,
    /// Device dispatcher health.
    pub dispatcher: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            cluster: ComponentHealth::Starting,
            coordinator: ComponentHealth::Starting,
            dispatcher: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to accept operations.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.cluster, self.coordinator, self.dispatcher),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        !matches!(
            (self.cluster, self.coordinator, self.dispatcher),
            (ComponentHealth::Failed, _, _)
                | (_, ComponentHealth::Failed, _)
                | (_, _, ComponentHealth::Failed)
        )
    }
}

/// Meterstore runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Local node identity.
    node_id: NodeId,

    /// Replicated map cluster shared with co-located nodes.
    cluster: InMemoryCluster,

    /// This node's view of the cluster.
    node: Option<ClusterNode>,

    /// Device mastership table.
    mastership: Arc<StaticMastership>,

    /// Lifecycle coordinator.
    coordinator: Option<Arc<LifecycleCoordinator>>,

    /// Device provider.
    provider: Option<Arc<LoopbackProvider>>,

    /// Device dispatcher and its lifecycle listener registration.
    dispatcher: Option<(Arc<DeviceDispatcher>, ListenerId)>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime with its own in-memory cluster.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_cluster(config, InMemoryCluster::new())
    }

    /// Create a runtime that joins an existing in-memory cluster.
    pub fn with_cluster(config: Config, cluster: InMemoryCluster) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let node_id = NodeId::new(config.node.node_id.clone());
        let mastership = if config.dispatch.master_by_default {
            StaticMastership::with_fallback(node_id.clone())
        } else {
            StaticMastership::new()
        };

        Ok(Self {
            config: Arc::new(config),
            node_id,
            cluster,
            node: None,
            mastership: Arc::new(mastership),
            coordinator: None,
            provider: None,
            dispatcher: None,
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the local node identity.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the cluster this runtime belongs to.
    pub fn cluster(&self) -> &InMemoryCluster {
        &self.cluster
    }

    /// Get the mastership table.
    pub fn mastership(&self) -> &Arc<StaticMastership> {
        &self.mastership
    }

    /// Get the lifecycle coordinator (if started).
    pub fn coordinator(&self) -> Option<&Arc<LifecycleCoordinator>> {
        self.coordinator.as_ref()
    }

    /// Get the device provider (if started).
    pub fn provider(&self) -> Option<&Arc<LoopbackProvider>> {
        self.provider.as_ref()
    }

    /// Get the device dispatcher (if started).
    pub fn dispatcher(&self) -> Option<&Arc<DeviceDispatcher>> {
        self.dispatcher.as_ref().map(|(d, _)| d)
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to accept operations.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is alive.
    pub fn is_alive(&self) -> bool {
        self.health.is_alive()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Initialize and start all runtime components.
    ///
    /// Components are started in order:
    /// 1. Cluster membership
    /// 2. Lifecycle coordinator
    /// 3. Device dispatcher
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(node = %self.node_id, "starting meterstore runtime");

        self.join_cluster()?;
        self.init_coordinator()?;
        self.init_dispatcher()?;

        self.running.store(true, Ordering::Release);
        tracing::info!(node = %self.node_id, "meterstore runtime started");
        Ok(())
    }

    fn join_cluster(&mut self) -> Result<()> {
        tracing::debug!("joining cluster");

        if self.cluster.members().contains(&self.node_id) {
            self.health.cluster = ComponentHealth::Failed;
            anyhow::bail!("node {} is already a cluster member", self.node_id);
        }
        self.node = Some(self.cluster.join(self.node_id.clone()));
        self.health.cluster = if self.cluster.is_available() {
            ComponentHealth::Healthy
        } else {
            ComponentHealth::Degraded
        };

        tracing::info!(
            node = %self.node_id,
            members = self.cluster.members().len(),
            "cluster joined"
        );
        Ok(())
    }

    fn init_coordinator(&mut self) -> Result<()> {
        tracing::debug!("initializing lifecycle coordinator");

        let node = self
            .node
            .as_ref()
            .context("coordinator requires cluster membership")?;
        let coordinator = LifecycleCoordinator::on_node(node, self.config.store.options());

        self.coordinator = Some(Arc::new(coordinator));
        self.health.coordinator = ComponentHealth::Healthy;

        tracing::info!(
            default_max_ids = self.config.store.default_max_ids,
            user_defined_index = self.config.store.user_defined_index,
            "lifecycle coordinator initialized"
        );
        Ok(())
    }

    fn init_dispatcher(&mut self) -> Result<()> {
        tracing::debug!("initializing device dispatcher");

        let coordinator = self
            .coordinator
            .as_ref()
            .context("dispatcher requires a coordinator")?;
        let provider = Arc::new(LoopbackProvider::new(coordinator));

        let mastership: Arc<dyn MastershipService> = self.mastership.clone();
        let device_provider: Arc<dyn DeviceProvider> = provider.clone();
        let dispatcher = DeviceDispatcher::start(
            self.node_id.clone(),
            self.config.dispatch.workers,
            mastership,
            device_provider,
        );
        let listener = coordinator.add_listener(dispatcher.clone());

        self.provider = Some(provider);
        self.dispatcher = Some((dispatcher, listener));
        self.health.dispatcher = ComponentHealth::Healthy;

        tracing::info!(workers = self.config.dispatch.workers, "device dispatcher initialized");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for shutdown signal.
    pub async fn wait_for_shutdown(&mut self) {
        let mut rx = self.shutdown_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Run the runtime until ctrl-c or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await?;
        Ok(())
    }

    /// Stop all runtime components.
    ///
    /// Components are stopped in reverse order:
    /// 1. Device dispatcher
    /// 2. Lifecycle coordinator
    /// 3. Cluster membership
    pub async fn stop(&mut self) -> Result<()> {
        tracing::info!(node = %self.node_id, "stopping meterstore runtime");
        self.running.store(false, Ordering::Release);

        let _ = self.shutdown_tx.send(true);

        self.stop_dispatcher().await;
        self.stop_coordinator();
        self.leave_cluster();

        tracing::info!(node = %self.node_id, "meterstore runtime stopped");
        Ok(())
    }

    async fn stop_dispatcher(&mut self) {
        tracing::debug!("stopping device dispatcher");
        self.health.dispatcher = ComponentHealth::Stopping;

        if let Some((dispatcher, listener)) = self.dispatcher.take() {
            if let Some(coordinator) = self.coordinator.as_ref() {
                coordinator.remove_listener(listener);
            }
            dispatcher.stop().await;
        }
        self.provider = None;

        self.health.dispatcher = ComponentHealth::Stopped;
    }

    fn stop_coordinator(&mut self) {
        tracing::debug!("stopping lifecycle coordinator");
        self.health.coordinator = ComponentHealth::Stopping;

        if let Some(coordinator) = self.coordinator.take() {
            coordinator.shutdown();
        }

        self.health.coordinator = ComponentHealth::Stopped;
    }

    fn leave_cluster(&mut self) {
        self.health.cluster = ComponentHealth::Stopping;
        if self.node.take().is_some() {
            self.cluster.leave(&self.node_id);
        }
        self.health.cluster = ComponentHealth::Stopped;
    }
}
