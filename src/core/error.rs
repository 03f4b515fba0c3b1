//! Error types for the meter store.
//!
//! Two families exist. [`StoreError`] is returned synchronously by store
//! operations (before or instead of a map write). [`OperationError`] is the
//! failure outcome carried by a pending operation once it resolves.

use crate::store::record::{DeviceId, FailReason, ResourceKey};
use thiserror::Error;

/// Synchronous store errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The replicated map is unavailable (quorum or replica loss).
    #[error("storage failure: {message}")]
    StorageFailure { message: String },

    /// No free identifier remains in the device's pool.
    #[error("identifier pool exhausted for device {device_id}")]
    IdExhausted { device_id: DeviceId },

    /// The device's published capacity is already fully used.
    #[error("device {device_id} capacity of {limit} resources exceeded")]
    CapacityExceeded { device_id: DeviceId, limit: u32 },

    /// The descriptor is not acceptable for the target device or key.
    #[error("invalid resource: {message}")]
    InvalidResource { message: String },

    /// The operation targets a key that holds no state record.
    #[error("resource {key} not found")]
    NotFound { key: ResourceKey },
}

impl StoreError {
    /// Create a StorageFailure error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageFailure {
            message: message.into(),
        }
    }

    /// Create an InvalidResource error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    /// Check if this error came from the storage layer.
    ///
    /// The store never retries these; the caller decides.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::StorageFailure { .. })
    }

    /// Check if the request was rejected before any map write happened.
    pub fn is_rejected_before_write(&self) -> bool {
        matches!(
            self,
            Self::IdExhausted { .. } | Self::CapacityExceeded { .. } | Self::InvalidResource { .. }
        )
    }
}

/// Result type using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure outcome of a pending install or remove.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The map write backing the operation failed.
    #[error("storage failure: {message}")]
    StorageFailure { message: String },

    /// The device refused the operation.
    #[error("device rejected operation: {reason}")]
    DeviceRejected { reason: FailReason },

    /// The operation is not legal for the resource's current state.
    #[error("invalid operation: {message}")]
    Invalid { message: String },

    /// A later operation on the same key replaced this one.
    #[error("superseded by a later operation on the same resource")]
    Superseded,

    /// The resource was forcibly deleted while the install was pending.
    #[error("resource purged before the operation completed")]
    Purged,

    /// The coordinator shut down before the operation completed.
    #[error("store shut down before the operation completed")]
    Shutdown,
}

impl OperationError {
    /// The device failure reason, if the device rejected the operation.
    pub fn reason(&self) -> Option<FailReason> {
        match self {
            Self::DeviceRejected { reason } => Some(*reason),
            _ => None,
        }
    }
}

impl From<StoreError> for OperationError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::StorageFailure { message } => Self::StorageFailure { message },
            other => Self::Invalid {
                message: other.to_string(),
            },
        }
    }
}

/// Outcome delivered by a pending operation.
pub type OperationResult = Result<(), OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_before_write_classification() {
        let exhausted = StoreError::IdExhausted {
            device_id: DeviceId::new("of:1"),
        };
        assert!(exhausted.is_rejected_before_write());
        assert!(!exhausted.is_storage_failure());
        assert!(StoreError::storage("quorum lost").is_storage_failure());
    }

    #[test]
    fn device_rejection_exposes_reason() {
        let err = OperationError::DeviceRejected {
            reason: FailReason::Timeout,
        };
        assert_eq!(err.reason(), Some(FailReason::Timeout));
        assert_eq!(OperationError::Purged.reason(), None);
    }

    #[test]
    fn storage_error_maps_to_operation_error() {
        let op: OperationError = StoreError::storage("replica lost").into();
        assert_eq!(
            op,
            OperationError::StorageFailure {
                message: "replica lost".to_string()
            }
        );
    }
}
