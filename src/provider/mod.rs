//! Device-facing side of the store.
//!
//! The store never programs hardware itself. Lifecycle request events are
//! handed to a [`DeviceProvider`] on the node that holds device mastership,
//! and the provider reports back through the coordinator's
//! `device_ack` / `device_failure` / `update_from_device` callbacks.

pub mod dispatcher;
pub mod loopback;

use crate::store::record::{ResourceDescriptor, ResourceKey};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use dispatcher::{DeviceDispatcher, DispatchStats};
pub use loopback::LoopbackProvider;

/// Kind of device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceOpType {
    /// Program the meter.
    Add,
    /// Delete the meter.
    Remove,
}

impl fmt::Display for DeviceOpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// A request for the device to program or delete a meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOperation {
    /// What to do.
    pub op_type: DeviceOpType,
    /// Meter identity on the device.
    pub key: ResourceKey,
    /// Meter configuration; unknown for meters found only on the device.
    pub descriptor: Option<ResourceDescriptor>,
}

impl DeviceOperation {
    /// Create an add operation.
    pub fn add(key: ResourceKey, descriptor: ResourceDescriptor) -> Self {
        Self {
            op_type: DeviceOpType::Add,
            key,
            descriptor: Some(descriptor),
        }
    }

    /// Create a remove operation.
    pub fn remove(key: ResourceKey, descriptor: Option<ResourceDescriptor>) -> Self {
        Self {
            op_type: DeviceOpType::Remove,
            key,
            descriptor,
        }
    }
}

/// Programs meters onto devices.
///
/// `perform` must not block; the outcome is reported later through the
/// coordinator callbacks.
pub trait DeviceProvider: Send + Sync {
    /// Execute an operation on the device.
    fn perform(&self, operation: DeviceOperation);
}
