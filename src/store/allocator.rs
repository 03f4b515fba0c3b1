//! Per-device identifier allocation.
//!
//! Each device owns an [`IdPool`] bitset stored in its own replicated map.
//! Bit 0 is reserved, a set bit is an allocated identifier, and a released
//! identifier is reusable immediately: allocation always returns the lowest
//! free bit. All mutations go through the map's atomic compute so that
//! concurrent acquire/release calls for the same device never lose updates.
//!
//! A pool covers the device's published index range, or
//! `1..=default_capacity` without capabilities, and never exceeds
//! [`MAX_POOL_SIZE`]. Pools created before capabilities were published grow
//! to the published range on the next write.

use crate::control::capabilities::CapabilityRegistry;
use crate::core::config::MAX_POOL_SIZE;
use crate::core::error::StoreResult;
use crate::store::map::{ReplicatedMap, Update};
use crate::store::record::DeviceId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Name of the replicated identifier pool map.
pub const ID_POOL_MAP: &str = "meterstore-id-pools";

const WORD_BITS: u32 = 64;

/// Bitset of allocated identifiers for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdPool {
    /// Highest allocatable identifier.
    capacity: u32,
    /// Bit words; bit `i` of word `w` is identifier `w * 64 + i`.
    words: Vec<u64>,
}

impl IdPool {
    /// Create a pool for identifiers `1..=capacity`.
    pub fn new(capacity: u32) -> Self {
        let word_count = (capacity / WORD_BITS + 1) as usize;
        let mut words = vec![0u64; word_count];
        words[0] = 1; // identifier 0 is never handed out
        Self { capacity, words }
    }

    /// Highest allocatable identifier.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Check if an identifier is allocated.
    pub fn is_set(&self, id: u32) -> bool {
        if id > self.capacity {
            return false;
        }
        let (word, bit) = Self::position(id);
        self.words[word] & (1u64 << bit) != 0
    }

    /// Raise the capacity. Returns false if the pool is already that large.
    pub fn grow(&mut self, capacity: u32) -> bool {
        if capacity <= self.capacity {
            return false;
        }
        self.words.resize((capacity / WORD_BITS + 1) as usize, 0);
        self.capacity = capacity;
        true
    }

    /// Lowest free identifier, if any.
    pub fn first_free(&self) -> Option<u32> {
        self.first_free_in(1, self.capacity)
    }

    /// Lowest free identifier within `start..=end`, if any.
    pub fn first_free_in(&self, start: u32, end: u32) -> Option<u32> {
        let start = start.max(1);
        let end = end.min(self.capacity);
        if start > end {
            return None;
        }

        let (first, first_bit) = Self::position(start);
        let (last, _) = Self::position(end);
        for index in first..=last {
            let mut word = self.words[index];
            if index == first {
                word |= (1u64 << first_bit) - 1;
            }
            if word == u64::MAX {
                continue;
            }
            let id = index as u32 * WORD_BITS + word.trailing_ones();
            return (id <= end).then_some(id);
        }
        None
    }

    /// Mark an identifier allocated. Returns false if it already was or is out of range.
    pub fn set(&mut self, id: u32) -> bool {
        if id == 0 || id > self.capacity || self.is_set(id) {
            return false;
        }
        let (word, bit) = Self::position(id);
        self.words[word] |= 1u64 << bit;
        true
    }

    /// Clear an identifier. Returns false if it was not allocated.
    pub fn clear(&mut self, id: u32) -> bool {
        if id == 0 || !self.is_set(id) {
            return false;
        }
        let (word, bit) = Self::position(id);
        self.words[word] &= !(1u64 << bit);
        true
    }

    /// Number of allocated identifiers.
    pub fn allocated(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum::<u32>() - 1
    }

    fn position(id: u32) -> (usize, u32) {
        ((id / WORD_BITS) as usize, id % WORD_BITS)
    }
}

/// Identifier allocator backed by the replicated pool map.
pub struct IdAllocator {
    pools: Arc<dyn ReplicatedMap<DeviceId, IdPool>>,
    capabilities: Arc<CapabilityRegistry>,
    default_capacity: u32,
}

impl IdAllocator {
    /// Create an allocator.
    ///
    /// `default_capacity` sizes pools of devices that published no capabilities.
    pub fn new(
        pools: Arc<dyn ReplicatedMap<DeviceId, IdPool>>,
        capabilities: Arc<CapabilityRegistry>,
        default_capacity: u32,
    ) -> Self {
        Self {
            pools,
            capabilities,
            default_capacity,
        }
    }

    /// Allocatable identifier range for a device, clamped to the pool limit.
    pub fn range_for(&self, device_id: &DeviceId) -> StoreResult<(u32, u32)> {
        let (start, end) = self
            .capabilities
            .index_range(device_id)?
            .unwrap_or((1, self.default_capacity));
        Ok((start.max(1), end.min(MAX_POOL_SIZE)))
    }

    /// Allocate the lowest free identifier for a device.
    ///
    /// Returns `None` when the pool is exhausted. Exhaustion observed on read
    /// returns before any write is issued.
    pub fn acquire(&self, device_id: &DeviceId) -> StoreResult<Option<u32>> {
        let (start, end) = self.range_for(device_id)?;
        if start > end {
            return Ok(None);
        }
        if let Some(pool) = self.pools.get(device_id)? {
            if pool.value.capacity() >= end && pool.value.first_free_in(start, end).is_none() {
                tracing::debug!(device = %device_id, "identifier pool exhausted");
                return Ok(None);
            }
        }

        let mut acquired = None;
        self.pools.compute(device_id, &mut |current| {
            acquired = None;
            let mut pool = current.cloned().unwrap_or_else(|| IdPool::new(end));
            let grown = pool.grow(end);
            match pool.first_free_in(start, end) {
                Some(id) => {
                    pool.set(id);
                    acquired = Some(id);
                    Update::Set(pool)
                }
                None if grown => Update::Set(pool),
                None => Update::Keep,
            }
        })?;

        if let Some(id) = acquired {
            tracing::trace!(device = %device_id, id, "identifier acquired");
        }
        Ok(acquired)
    }

    /// Mark a caller-chosen identifier allocated.
    ///
    /// Returns false if it is taken or outside the device's range.
    pub fn reserve(&self, device_id: &DeviceId, id: u32) -> StoreResult<bool> {
        let (start, end) = self.range_for(device_id)?;
        if id < start || id > end {
            return Ok(false);
        }
        let mut reserved = false;
        self.pools.compute(device_id, &mut |current| {
            let mut pool = current.cloned().unwrap_or_else(|| IdPool::new(end));
            pool.grow(end);
            reserved = pool.set(id);
            if reserved {
                Update::Set(pool)
            } else {
                Update::Keep
            }
        })?;
        Ok(reserved)
    }

    /// Free an identifier. Returns false if it was not allocated.
    pub fn release(&self, device_id: &DeviceId, id: u32) -> StoreResult<bool> {
        let mut released = false;
        self.pools.compute_if_present(device_id, &mut |pool| {
            let mut pool = pool.clone();
            released = pool.clear(id);
            if released {
                Update::Set(pool)
            } else {
                Update::Keep
            }
        })?;

        if released {
            tracing::trace!(device = %device_id, id, "identifier released");
        }
        Ok(released)
    }

    /// Number of identifiers allocated on a device.
    pub fn in_use(&self, device_id: &DeviceId) -> StoreResult<u32> {
        Ok(self
            .pools
            .get(device_id)?
            .map(|p| p.value.allocated())
            .unwrap_or(0))
    }

    /// Check if an identifier is allocated on a device.
    pub fn is_allocated(&self, device_id: &DeviceId, id: u32) -> StoreResult<bool> {
        Ok(self
            .pools
            .get(device_id)?
            .is_some_and(|p| p.value.is_set(id)))
    }

    /// Forget a device's pool entirely.
    pub fn drop_pool(&self, device_id: &DeviceId) -> StoreResult<bool> {
        Ok(self.pools.remove(device_id)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_reserves_zero() {
        let pool = IdPool::new(4);
        assert!(pool.is_set(0));
        assert_eq!(pool.allocated(), 0);
        assert_eq!(pool.first_free(), Some(1));
    }

    #[test]
    fn pool_first_free_crosses_words() {
        let mut pool = IdPool::new(130);
        for id in 1..=127 {
            assert!(pool.set(id));
        }
        assert_eq!(pool.first_free(), Some(128));
        pool.clear(64);
        assert_eq!(pool.first_free(), Some(64));
    }

    #[test]
    fn pool_exhaustion_respects_capacity() {
        let mut pool = IdPool::new(3);
        assert!(pool.set(1));
        assert!(pool.set(2));
        assert!(pool.set(3));
        assert!(!pool.set(4));
        assert_eq!(pool.first_free(), None);
    }

    #[test]
    fn pool_grows_and_keeps_allocations() {
        let mut pool = IdPool::new(2);
        pool.set(1);
        pool.set(2);
        assert_eq!(pool.first_free(), None);
        assert!(pool.grow(100));
        assert!(!pool.grow(50));
        assert!(pool.is_set(2));
        assert_eq!(pool.first_free(), Some(3));
        assert!(pool.set(100));
    }

    #[test]
    fn pool_first_free_in_honours_range() {
        let mut pool = IdPool::new(200);
        assert_eq!(pool.first_free_in(70, 80), Some(70));
        assert_eq!(pool.first_free_in(0, 5), Some(1));
        for id in 130..=140 {
            pool.set(id);
        }
        assert_eq!(pool.first_free_in(130, 140), None);
        assert_eq!(pool.first_free_in(130, 141), Some(141));
        assert_eq!(pool.first_free_in(190, 250), Some(190));
        assert_eq!(pool.first_free_in(201, 250), None);
    }

    #[test]
    fn pool_capacity_at_word_boundary() {
        let mut pool = IdPool::new(63);
        for id in 1..=63 {
            assert!(pool.set(id));
        }
        assert_eq!(pool.first_free(), None);
        assert_eq!(pool.allocated(), 63);
    }

    #[test]
    fn pool_rejects_double_clear() {
        let mut pool = IdPool::new(8);
        pool.set(5);
        assert!(pool.clear(5));
        assert!(!pool.clear(5));
        assert!(!pool.clear(0));
    }
}
