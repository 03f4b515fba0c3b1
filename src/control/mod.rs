//! Cluster-wide control information consumed by the store.
//!
//! - [`capabilities`] - Replicated per-device meter capabilities
//! - [`mastership`] - Which node may talk to which device

pub mod capabilities;
pub mod mastership;
