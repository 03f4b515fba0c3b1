//! Resource identity, descriptors and the replicated state record.
//!
//! A [`StateRecord`] is the single value stored per [`ResourceKey`] in the
//! records map. Its absence means the meter is not installed.

use crate::control::mastership::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a programmable network device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a device identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identifier of the application that owns a meter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppId(String);

impl AppId {
    /// Create an application identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identity of a device-programmed object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Device the object is programmed on.
    pub device_id: DeviceId,
    /// Numeric identifier allocated from the device's pool.
    pub id: u32,
}

impl ResourceKey {
    /// Create a resource key.
    pub fn new(device_id: DeviceId, id: u32) -> Self {
        Self { device_id, id }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.id)
    }
}

/// Rate unit of a meter's bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeterUnit {
    /// Kilobits per second.
    KbPerSec,
    /// Packets per second.
    PktPerSec,
    /// Bytes per second.
    BytesPerSec,
}

impl fmt::Display for MeterUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KbPerSec => write!(f, "kbps"),
            Self::PktPerSec => write!(f, "pktps"),
            Self::BytesPerSec => write!(f, "bytesps"),
        }
    }
}

/// Action applied to traffic exceeding a band's rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandType {
    /// Drop packets.
    Drop,
    /// Remark the drop precedence of packets.
    Remark,
    /// Vendor specific behavior.
    Experimenter,
}

impl fmt::Display for BandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Remark => write!(f, "remark"),
            Self::Experimenter => write!(f, "experimenter"),
        }
    }
}

/// A single rate band of a meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Band {
    /// What happens to traffic above the rate.
    pub band_type: BandType,
    /// Rate in the meter's unit.
    pub rate: u64,
    /// Burst size, only honored when the meter carries the BURST flag.
    pub burst_size: Option<u64>,
    /// Drop precedence increment for remark bands.
    pub prec: Option<u8>,
}

impl Band {
    /// Create a drop band.
    pub fn drop(rate: u64) -> Self {
        Self {
            band_type: BandType::Drop,
            rate,
            burst_size: None,
            prec: None,
        }
    }

    /// Create a remark band.
    pub fn remark(rate: u64, prec: u8) -> Self {
        Self {
            band_type: BandType::Remark,
            rate,
            burst_size: None,
            prec: Some(prec),
        }
    }

    /// Set the burst size.
    pub fn with_burst(mut self, burst_size: u64) -> Self {
        self.burst_size = Some(burst_size);
        self
    }
}

bitflags::bitflags! {
    /// Behavioral flags of a meter.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MeterFlags: u32 {
        /// Bands carry burst sizes.
        const BURST = 0b0000_0001;
        /// Collect per-meter statistics.
        const STATS = 0b0000_0010;
    }
}

impl Default for MeterFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Caller-supplied configuration of a meter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Target device.
    pub device_id: DeviceId,
    /// Owning application.
    pub app_id: AppId,
    /// Rate unit for all bands.
    pub unit: MeterUnit,
    /// Rate bands, at least one.
    pub bands: Vec<Band>,
    /// Meter flags.
    pub flags: MeterFlags,
    /// Caller-chosen identifier, only accepted in user-defined index mode.
    pub index: Option<u32>,
}

impl ResourceDescriptor {
    /// Create a descriptor with a single drop band.
    pub fn new(device_id: DeviceId, app_id: AppId, unit: MeterUnit, rate: u64) -> Self {
        Self {
            device_id,
            app_id,
            unit,
            bands: vec![Band::drop(rate)],
            flags: MeterFlags::empty(),
            index: None,
        }
    }

    /// Replace the bands.
    pub fn with_bands(mut self, bands: Vec<Band>) -> Self {
        self.bands = bands;
        self
    }

    /// Add meter flags.
    pub fn with_flags(mut self, flags: MeterFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Request a specific identifier.
    pub fn with_index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Check if the meter uses burst sizes.
    pub fn is_burst(&self) -> bool {
        self.flags.contains(MeterFlags::BURST)
    }
}

/// Lifecycle state of a stored meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Install requested, device not yet acknowledged.
    PendingAdd,
    /// Installed on the device.
    Added,
    /// Removal requested, device not yet acknowledged.
    PendingRemove,
    /// Tombstone; consumed by the origin as soon as it is observed.
    Removed,
}

impl LifecycleState {
    /// Check if this is one of the pending states.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingAdd | Self::PendingRemove)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingAdd => write!(f, "PENDING_ADD"),
            Self::Added => write!(f, "ADDED"),
            Self::PendingRemove => write!(f, "PENDING_REMOVE"),
            Self::Removed => write!(f, "REMOVED"),
        }
    }
}

/// Reason reported by a device for a failed meter operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailReason {
    /// Unspecified device error.
    Unknown,
    /// The device does not understand the command.
    UnknownCommand,
    /// The meter does not exist on the device.
    UnknownMeter,
    /// The meter configuration is invalid.
    InvalidMeter,
    /// Unsupported flags.
    UnknownFlags,
    /// Unsupported band type.
    UnknownBand,
    /// Invalid band parameters.
    InvalidBand,
    /// No meter entries left on the device.
    OutOfMeters,
    /// Too many bands for the device.
    OutOfBands,
    /// The device did not answer in time.
    Timeout,
    /// The operation is not supported by the device.
    Unsupported,
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::UnknownCommand => "UNKNOWN_COMMAND",
            Self::UnknownMeter => "UNKNOWN_METER",
            Self::InvalidMeter => "INVALID_METER",
            Self::UnknownFlags => "UNKNOWN_FLAGS",
            Self::UnknownBand => "UNKNOWN_BAND",
            Self::InvalidBand => "INVALID_BAND",
            Self::OutOfMeters => "OUT_OF_METERS",
            Self::OutOfBands => "OUT_OF_BANDS",
            Self::Timeout => "TIMEOUT",
            Self::Unsupported => "UNSUPPORTED",
        };
        f.write_str(name)
    }
}

/// Counters reported by the device for an installed meter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterCounters {
    /// Packets processed by the meter.
    pub packets: u64,
    /// Bytes processed by the meter.
    pub bytes: u64,
    /// Seconds since the meter was installed.
    pub life_secs: u64,
    /// Number of flows referencing the meter.
    pub reference_count: u64,
}

/// Replicated state record, one per resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Identity of the meter.
    pub key: ResourceKey,
    /// Requested configuration.
    pub descriptor: ResourceDescriptor,
    /// Current lifecycle state.
    pub state: LifecycleState,
    /// Failure reason; only ever set on pending states.
    pub reason: Option<FailReason>,
    /// Node that issued the operation currently in flight.
    pub origin: NodeId,
    /// Last counters reported by the device.
    pub counters: MeterCounters,
}

impl StateRecord {
    /// Create a fresh PENDING_ADD record.
    pub fn pending_add(key: ResourceKey, descriptor: ResourceDescriptor, origin: NodeId) -> Self {
        Self {
            key,
            descriptor,
            state: LifecycleState::PendingAdd,
            reason: None,
            origin,
            counters: MeterCounters::default(),
        }
    }

    /// Check if a device failure is attached.
    pub fn is_failed(&self) -> bool {
        self.reason.is_some()
    }

    /// Check if the record was written by the given node.
    pub fn is_origin(&self, node: &NodeId) -> bool {
        &self.origin == node
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_display() {
        let key = ResourceKey::new(DeviceId::new("of:0001"), 7);
        assert_eq!(key.to_string(), "of:0001/7");
    }

    #[test]
    fn descriptor_builder_sets_flags_and_index() {
        let descriptor = ResourceDescriptor::new(
            DeviceId::new("of:1"),
            AppId::new("app"),
            MeterUnit::KbPerSec,
            10,
        )
        .with_flags(MeterFlags::BURST)
        .with_index(4);

        assert!(descriptor.is_burst());
        assert_eq!(descriptor.index, Some(4));
        assert_eq!(descriptor.bands, vec![Band::drop(10)]);
    }

    #[test]
    fn lifecycle_state_pending() {
        assert!(LifecycleState::PendingAdd.is_pending());
        assert!(LifecycleState::PendingRemove.is_pending());
        assert!(!LifecycleState::Added.is_pending());
        assert!(!LifecycleState::Removed.is_pending());
        assert_eq!(FailReason::Timeout.to_string(), "TIMEOUT");
    }
}
