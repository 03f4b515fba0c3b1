//! Meterstore - replicated lifecycle store for device-programmed meters.
//!
//! Every node of a cluster shares a replicated map of meter records. An
//! install or remove issued on one node is written as a pending record, the
//! device master forwards it to the device, and the device's answer moves the
//! record on. The node that issued the operation, and only that node,
//! resolves the caller's future.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │          install / remove  →  PendingOperation               │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Lifecycle Coordinator                      │
//! │   transitions │ pending table │ id pools │ lifecycle events  │
//! └──────────────────────────────────────────────────────────────┘
//!            │                                      ▲
//! ┌────────────────────────┐           ┌─────────────────────────┐
//! │    Replicated maps     │           │   Device dispatcher     │
//! │ records │ pools │ caps │           │  mastership │ provider  │
//! └────────────────────────┘           └─────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Runtime orchestration
//! - [`core::error`] - Error types
//!
//! ## Control
//! - [`control::capabilities`] - Device capability registry
//! - [`control::mastership`] - Device mastership
//!
//! ## Store
//! - [`store::record`] - Records, keys and descriptors
//! - [`store::map`] - Replicated map contract
//! - [`store::memory`] - In-process replicated map cluster
//! - [`store::allocator`] - Per-device identifier pools
//! - [`store::transition`] - Lifecycle transition table
//! - [`store::pending`] - Local table of unresolved operations
//! - [`store::events`] - Lifecycle events and listeners
//! - [`store::coordinator`] - Install, remove and device callbacks
//! - [`store::reconcile`] - Device table reconciliation
//!
//! ## Provider
//! - [`provider::dispatcher`] - Mastership-gated request forwarding
//! - [`provider::loopback`] - In-memory device provider
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Identifier pools are only mutated through the replicated map.
//! - Identifier 0 is never allocated.
//! - A pending future is resolved at most once, by its origin node.
//! - A `REMOVED` tombstone is deleted by the node that requested the removal.

// Core infrastructure
pub mod core;

// Capabilities and mastership
pub mod control;

// Replicated store and lifecycle
pub mod store;

// Device-facing side
pub mod provider;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use control::{capabilities, mastership};
pub use provider::{DeviceDispatcher, DeviceOperation, DeviceProvider, LoopbackProvider};
pub use store::coordinator::{LifecycleCoordinator, StoreOptions};
pub use store::events::{LifecycleEvent, LifecycleEventType, LifecycleListener};
pub use store::pending::PendingOperation;
pub use store::record::{
    AppId, DeviceId, FailReason, LifecycleState, ResourceDescriptor, ResourceKey, StateRecord,
};
