//! Error types for shmbuf.
//!
//! Capacity, not-found and transactional failures are ordinary values of
//! [`StoreError`]. Header protocol violations are not: they go through
//! [`crate::header::protocol_violation`] and terminate the process.

use crate::types::{BufferRef, StreamId};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for shmbuf operations.
#[derive(Error, Debug)]
pub enum StoreError {
    // =========================================================================
    // Identifier Errors (E001-E099)
    // =========================================================================
    /// Bucket index outside `0..=15` (or above the configured maximum).
    #[error("E001: Bucket index {bucket} out of range (max {max})")]
    InvalidBucketIndex {
        /// The rejected bucket index.
        bucket: u32,
        /// Highest bucket index accepted.
        max: u32,
    },

    /// Buffer index outside `1..=2^27-1`.
    #[error("E002: Buffer index {index} out of range (valid 1..={max})")]
    InvalidBufferIndex {
        /// The rejected buffer index.
        index: u64,
        /// Highest buffer index accepted.
        max: u32,
    },

    // =========================================================================
    // Not-Found Errors (E100-E199)
    // =========================================================================
    /// The buffer is not in the allocated table.
    #[error("E101: Buffer {buffer_ref} is not allocated")]
    BufferNotAllocated {
        /// The buffer that was expected to be allocated.
        buffer_ref: BufferRef,
    },

    // =========================================================================
    // Capacity Errors (E200-E299)
    // =========================================================================
    /// The allocation budget would be exceeded.
    #[error(
        "E201: Capacity exceeded: requested {requested} bytes with {used} of {budget} bytes in use"
    )]
    CapacityExceeded {
        /// Slot size of the requested allocation.
        requested: u64,
        /// Bytes currently allocated across all buckets.
        used: u64,
        /// Configured total budget.
        budget: u64,
    },

    /// Not enough free disk space to create a bucket file.
    #[error(
        "E202: Insufficient disk space for {path}: need {required} bytes, {available} available"
    )]
    DiskSpace {
        /// The bucket file that could not be created.
        path: PathBuf,
        /// Bytes required including the safety margin.
        required: u64,
        /// Bytes reported free on the filesystem.
        available: u64,
    },

    /// A bucket has issued every representable buffer index.
    #[error("E203: Bucket {bucket} has no buffer indices left")]
    BucketExhausted {
        /// The exhausted bucket.
        bucket: u8,
    },

    /// No bucket is large enough for the requested size.
    #[error("E204: Request of {requested} bytes exceeds the largest buffer ({max} bytes)")]
    RequestTooLarge {
        /// Requested payload size.
        requested: usize,
        /// Largest payload any configured bucket offers.
        max: usize,
    },

    // =========================================================================
    // Allocation Table Errors (E300-E399)
    // =========================================================================
    /// Failed to open the allocation table environment.
    #[error("E301: Failed to open allocation table at {path}: {cause}")]
    TableOpen {
        /// Directory of the environment.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// A transaction against the allocation table failed and was aborted.
    #[error("E302: Allocation table transaction failed: {cause}")]
    Transaction {
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Bucket Storage Errors (E400-E499)
    // =========================================================================
    /// Failed to create or open a bucket file.
    #[error("E401: Failed to open bucket file {path}: {cause}")]
    BucketFile {
        /// The bucket file path.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Failed to memory-map a bucket file.
    #[error("E402: Failed to mmap bucket file {path}: {cause}")]
    BucketMmap {
        /// The bucket file path.
        path: PathBuf,
        /// Reason for the mmap failure.
        cause: String,
    },

    // =========================================================================
    // Packer Errors (E500-E599)
    // =========================================================================
    /// Packing a stream failed.
    #[error("E501: Packing stream {stream} failed: {cause}")]
    PackFailed {
        /// The stream being packed.
        stream: StreamId,
        /// Reason for the failure.
        cause: String,
    },

    /// The block storage collaborator failed.
    #[error("E502: Block storage error: {cause}")]
    BlockStorage {
        /// Reason for the failure.
        cause: String,
    },

    /// A persisted block frame failed verification.
    #[error("E503: Corrupt packed block: {cause}")]
    CorruptBlock {
        /// Description of the corruption.
        cause: String,
    },

    /// The packer runtime could not be started.
    #[error("E504: Failed to start packer: {cause}")]
    PackerStart {
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Configuration Errors (E800-E899)
    // =========================================================================
    /// Failed to parse a YAML configuration.
    #[error("E801: Failed to parse YAML at {path}: {cause}")]
    YamlParse {
        /// Source of the YAML document.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },

    /// Invalid configuration value.
    #[error("E802: Invalid configuration '{field}': {cause}")]
    ConfigValue {
        /// The offending field.
        field: String,
        /// Why the value is invalid.
        cause: String,
    },

    // =========================================================================
    // I/O Errors (E900-E999)
    // =========================================================================
    /// I/O error at a path.
    #[error("E901: I/O error at {path}: {cause}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// Reason for the failure.
        cause: String,
    },
}

impl StoreError {
    /// Get the error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidBucketIndex { .. } => "E001",
            Self::InvalidBufferIndex { .. } => "E002",
            Self::BufferNotAllocated { .. } => "E101",
            Self::CapacityExceeded { .. } => "E201",
            Self::DiskSpace { .. } => "E202",
            Self::BucketExhausted { .. } => "E203",
            Self::RequestTooLarge { .. } => "E204",
            Self::TableOpen { .. } => "E301",
            Self::Transaction { .. } => "E302",
            Self::BucketFile { .. } => "E401",
            Self::BucketMmap { .. } => "E402",
            Self::PackFailed { .. } => "E501",
            Self::BlockStorage { .. } => "E502",
            Self::CorruptBlock { .. } => "E503",
            Self::PackerStart { .. } => "E504",
            Self::YamlParse { .. } => "E801",
            Self::ConfigValue { .. } => "E802",
            Self::Io { .. } => "E901",
        }
    }

    /// Capacity errors: the caller may compact or free memory and retry.
    #[must_use]
    pub fn is_capacity_error(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::DiskSpace { .. }
                | Self::BucketExhausted { .. }
                | Self::RequestTooLarge { .. }
        )
    }

    /// Not-found and range errors.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::BufferNotAllocated { .. }
                | Self::InvalidBucketIndex { .. }
                | Self::InvalidBufferIndex { .. }
        )
    }

    /// Check if this error is retriable as-is.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Transaction { .. } | Self::BlockStorage { .. } | Self::PackFailed { .. }
        )
    }
}

impl From<heed::Error> for StoreError {
    fn from(e: heed::Error) -> Self {
        Self::Transaction {
            cause: e.to_string(),
        }
    }
}

/// Result type alias for shmbuf operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes() {
        let err = StoreError::InvalidBucketIndex { bucket: 16, max: 15 };
        assert_eq!(err.code(), "E001");
        assert!(err.to_string().starts_with("E001:"));

        let err = StoreError::CapacityExceeded {
            requested: 2048,
            used: 4096,
            budget: 4096,
        };
        assert_eq!(err.code(), "E201");
    }

    #[test]
    fn classification() {
        let not_found = StoreError::BufferNotAllocated {
            buffer_ref: BufferRef::from_raw(0x0800_0001),
        };
        assert!(not_found.is_not_found());
        assert!(!not_found.is_capacity_error());

        let disk = StoreError::DiskSpace {
            path: PathBuf::from("/tmp/x"),
            required: 10,
            available: 1,
        };
        assert!(disk.is_capacity_error());
        assert!(!disk.is_retriable());

        let txn = StoreError::Transaction {
            cause: "map full".into(),
        };
        assert!(txn.is_retriable());
    }
}
