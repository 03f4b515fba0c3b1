//! Replicated meter store.
//!
//! - `map`: replicated map abstraction
//! - `memory`: in-memory cluster backing the map
//! - `record`: keys, descriptors and state records
//! - `allocator`: per-device identifier pools
//! - `transition`: lifecycle transition table
//! - `events`: typed lifecycle events
//! - `pending`: local pending operations
//! - `coordinator`: the lifecycle coordinator
//! - `reconcile`: device report reconciliation

pub mod allocator;
pub mod coordinator;
pub mod events;
pub mod map;
pub mod memory;
pub mod pending;
pub mod reconcile;
pub mod record;
pub mod transition;
