//! Device capability registry.
//!
//! Devices publish their static meter capabilities (table size, supported
//! units and band types, feature flags) once on connect. Records live in
//! their own replicated map, are written put-if-absent and removed wholesale
//! when the device disconnects. The coordinator only reads them, to reject
//! installs synchronously.

use crate::core::error::{StoreError, StoreResult};
use crate::store::map::{ReplicatedMap, Update};
use crate::store::record::{BandType, DeviceId, MeterUnit, ResourceDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Name of the replicated capability map.
pub const CAPABILITY_MAP: &str = "meterstore-capabilities";

bitflags::bitflags! {
    /// Optional meter features a device may support.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FeatureFlags: u32 {
        /// Bands may carry burst sizes.
        const BURST = 0b0000_0001;
        /// The device reports per-meter statistics.
        const STATS = 0b0000_0010;
    }
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Static meter capabilities of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Device identifier.
    pub device_id: DeviceId,

    /// Maximum number of meters the device can hold.
    pub max_resources: u32,

    /// First identifier of the device's meter table.
    pub start_index: u32,

    /// Last identifier of the device's meter table.
    pub end_index: u32,

    /// Maximum bands per meter.
    pub max_bands: u8,

    /// Maximum color value for remark bands.
    pub max_color: u8,

    /// Supported rate units.
    pub units: HashSet<MeterUnit>,

    /// Supported band types.
    pub band_types: HashSet<BandType>,

    /// Optional features.
    pub features: FeatureFlags,
}

impl DeviceCapabilities {
    /// Create capabilities with kbps/pktps units and drop/remark bands.
    ///
    /// The meter table spans identifiers `1..=max_resources`.
    pub fn new(device_id: DeviceId, max_resources: u32) -> Self {
        Self {
            device_id,
            max_resources,
            start_index: 1,
            end_index: max_resources,
            max_bands: 1,
            max_color: 0,
            units: [MeterUnit::KbPerSec, MeterUnit::PktPerSec].into_iter().collect(),
            band_types: [BandType::Drop, BandType::Remark].into_iter().collect(),
            features: FeatureFlags::empty(),
        }
    }

    /// Set the maximum number of bands.
    pub fn with_max_bands(mut self, max_bands: u8) -> Self {
        self.max_bands = max_bands;
        self
    }

    /// Set the identifier range of the meter table.
    pub fn with_index_range(mut self, start_index: u32, end_index: u32) -> Self {
        self.start_index = start_index;
        self.end_index = end_index;
        self
    }

    /// Enable features.
    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features |= features;
        self
    }

    /// Check if a unit is supported.
    pub fn supports_unit(&self, unit: MeterUnit) -> bool {
        self.units.contains(&unit)
    }

    /// Check if a band type is supported.
    pub fn supports_band(&self, band_type: BandType) -> bool {
        self.band_types.contains(&band_type)
    }

    /// Check if a feature is supported.
    pub fn supports(&self, feature: FeatureFlags) -> bool {
        self.features.contains(feature)
    }

    /// Check if an identifier falls inside the device's meter table.
    ///
    /// Identifier 0 is never valid.
    pub fn is_index_valid(&self, index: u32) -> bool {
        index != 0 && (self.start_index..=self.end_index).contains(&index)
    }

    /// Validate a descriptor against these capabilities.
    pub fn validate(&self, descriptor: &ResourceDescriptor) -> StoreResult<()> {
        if !self.supports_unit(descriptor.unit) {
            return Err(StoreError::invalid(format!(
                "device {} does not support unit {}",
                self.device_id, descriptor.unit
            )));
        }

        if descriptor.bands.len() > usize::from(self.max_bands) {
            return Err(StoreError::invalid(format!(
                "device {} supports at most {} bands, got {}",
                self.device_id,
                self.max_bands,
                descriptor.bands.len()
            )));
        }

        if let Some(band) = descriptor
            .bands
            .iter()
            .find(|b| !self.supports_band(b.band_type))
        {
            return Err(StoreError::invalid(format!(
                "device {} does not support {} bands",
                self.device_id, band.band_type
            )));
        }

        if descriptor.is_burst() && !self.supports(FeatureFlags::BURST) {
            return Err(StoreError::invalid(format!(
                "device {} does not support burst",
                self.device_id
            )));
        }

        if let Some(index) = descriptor.index {
            if !self.is_index_valid(index) {
                return Err(StoreError::invalid(format!(
                    "index {} outside device {} range {}..={}",
                    index, self.device_id, self.start_index, self.end_index
                )));
            }
        }

        Ok(())
    }
}

/// Replicated registry of device capabilities.
pub struct CapabilityRegistry {
    map: Arc<dyn ReplicatedMap<DeviceId, DeviceCapabilities>>,
}

impl CapabilityRegistry {
    /// Create a registry on top of a replicated map.
    pub fn new(map: Arc<dyn ReplicatedMap<DeviceId, DeviceCapabilities>>) -> Self {
        Self { map }
    }

    /// Publish capabilities if none are stored for the device yet.
    ///
    /// Returns true if this call stored them.
    ///
    /// Fails with `InvalidResource` if the identifier range is empty.
    pub fn publish(&self, capabilities: DeviceCapabilities) -> StoreResult<bool> {
        if capabilities.start_index > capabilities.end_index {
            return Err(StoreError::invalid(format!(
                "device {} publishes empty index range {}..={}",
                capabilities.device_id, capabilities.start_index, capabilities.end_index
            )));
        }
        let device_id = capabilities.device_id.clone();
        let mut pending = Some(capabilities);
        let mut stored = false;

        self.map.compute(&device_id, &mut |current| match current {
            Some(_) => Update::Keep,
            None => match pending.take() {
                Some(caps) => {
                    stored = true;
                    Update::Set(caps)
                }
                None => Update::Keep,
            },
        })?;

        if stored {
            tracing::info!(device = %device_id, "device capabilities published");
        }
        Ok(stored)
    }

    /// Get a device's capabilities.
    pub fn get(&self, device_id: &DeviceId) -> StoreResult<Option<DeviceCapabilities>> {
        Ok(self.map.get(device_id)?.map(|v| v.value))
    }

    /// Remove a device's capabilities.
    pub fn remove(&self, device_id: &DeviceId) -> StoreResult<Option<DeviceCapabilities>> {
        let removed = self.map.remove(device_id)?.map(|v| v.value);
        if removed.is_some() {
            tracing::info!(device = %device_id, "device capabilities removed");
        }
        Ok(removed)
    }

    /// Maximum meters for a device, if it published capabilities.
    pub fn max_resources(&self, device_id: &DeviceId) -> StoreResult<Option<u32>> {
        Ok(self.get(device_id)?.map(|c| c.max_resources))
    }

    /// Identifier range for a device, if it published capabilities.
    pub fn index_range(&self, device_id: &DeviceId) -> StoreResult<Option<(u32, u32)>> {
        Ok(self
            .get(device_id)?
            .map(|c| (c.start_index, c.end_index)))
    }

    /// Validate a descriptor against the target device's capabilities.
    ///
    /// Devices without published capabilities accept any descriptor.
    pub fn validate(&self, descriptor: &ResourceDescriptor) -> StoreResult<()> {
        match self.get(&descriptor.device_id)? {
            Some(caps) => caps.validate(descriptor),
            None => Ok(()),
        }
    }

    /// All devices with published capabilities.
    pub fn device_ids(&self) -> StoreResult<Vec<DeviceId>> {
        Ok(self.map.entries()?.into_iter().map(|(k, _)| k).collect())
    }

    /// Number of devices with published capabilities.
    pub fn device_count(&self) -> StoreResult<usize> {
        Ok(self.map.entries()?.len())
    }
}
