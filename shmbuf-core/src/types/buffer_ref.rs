//! Packed cross-process buffer identifier.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Flag bit (bit 31).
pub const FLAG_MASK: u32 = 1 << 31;

const BUCKET_SHIFT: u32 = 27;
const BUCKET_MASK: u32 = 0b1111 << BUCKET_SHIFT;

/// Mask of the 27 buffer-index bits.
pub const BUFFER_INDEX_MASK: u32 = (1 << BUCKET_SHIFT) - 1;

/// Highest bucket index a [`BufferRef`] can encode.
pub const MAX_BUCKET_INDEX: u8 = 15;

/// Highest buffer index a [`BufferRef`] can encode. Index 0 is reserved.
pub const MAX_BUFFER_INDEX: u32 = BUFFER_INDEX_MASK;

/// A 32-bit buffer identifier shared by every process attached to a store.
///
/// ```text
/// bit  31      30..27        26..0
///     ┌────┬─────────────┬──────────────────┐
///     │flag│ bucket (4b) │ buffer index(27b)│
///     └────┴─────────────┴──────────────────┘
/// ```
///
/// The identifier is the address: bucket storage turns it into a file and
/// slot offset with arithmetic only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct BufferRef(u32);

impl BufferRef {
    /// Create a ref with the flag cleared.
    ///
    /// # Errors
    /// Returns a range error if `bucket > 15` or `index` is outside `1..=2^27-1`.
    pub fn new(bucket: u8, index: u32) -> Result<Self> {
        Self::with_flag(bucket, index, false)
    }

    /// Create a ref with an explicit flag bit.
    ///
    /// # Errors
    /// Same as [`BufferRef::new`].
    pub fn with_flag(bucket: u8, index: u32, flag: bool) -> Result<Self> {
        if bucket > MAX_BUCKET_INDEX {
            return Err(StoreError::InvalidBucketIndex {
                bucket: bucket as u32,
                max: MAX_BUCKET_INDEX as u32,
            });
        }
        if index == 0 || index > MAX_BUFFER_INDEX {
            return Err(StoreError::InvalidBufferIndex {
                index: index as u64,
                max: MAX_BUFFER_INDEX,
            });
        }
        let flag_bit = if flag { FLAG_MASK } else { 0 };
        Ok(Self(flag_bit | ((bucket as u32) << BUCKET_SHIFT) | index))
    }

    /// Reinterpret a raw 32-bit value. No validation is performed.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Power-of-two size class, `0..=15`.
    #[must_use]
    pub const fn bucket_index(self) -> u8 {
        ((self.0 & BUCKET_MASK) >> BUCKET_SHIFT) as u8
    }

    /// Dense, 1-based index within the bucket.
    #[must_use]
    pub const fn buffer_index(self) -> u32 {
        self.0 & BUFFER_INDEX_MASK
    }

    /// The flag bit.
    #[must_use]
    pub const fn flag(self) -> bool {
        self.0 & FLAG_MASK != 0
    }

    /// A copy with the flag bit set.
    #[must_use]
    pub const fn set_flag(self) -> Self {
        Self(self.0 | FLAG_MASK)
    }

    /// A copy with the flag bit cleared.
    #[must_use]
    pub const fn clear_flag(self) -> Self {
        Self(self.0 & !FLAG_MASK)
    }

    /// `true` when the bucket index is non-zero.
    ///
    /// Refs in bucket 0 report `false` here even when they name a real
    /// buffer; callers that handle bucket 0 must not rely on this check.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.bucket_index() > 0
    }

    /// Little-endian wire form.
    #[must_use]
    pub const fn to_le_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Parse the little-endian wire form.
    #[must_use]
    pub const fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}:{}", self.bucket_index(), self.buffer_index())?;
        if self.flag() {
            write!(f, "*")?;
        }
        Ok(())
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BufferRef({self}, raw=0x{:08x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn packed_fields_survive(bucket in 0u8..=15, index in 1u32..=MAX_BUFFER_INDEX, flag: bool) {
            let r = BufferRef::with_flag(bucket, index, flag).unwrap();
            prop_assert_eq!(r.bucket_index(), bucket);
            prop_assert_eq!(r.buffer_index(), index);
            prop_assert_eq!(r.flag(), flag);
        }

        #[test]
        fn rejects_out_of_range_bucket(bucket in 16u8..=u8::MAX, index in 1u32..=MAX_BUFFER_INDEX) {
            let err = BufferRef::new(bucket, index).unwrap_err();
            prop_assert!(err.is_not_found());
            prop_assert_eq!(err.code(), "E001");
        }
    }

    #[test]
    fn rejects_reserved_and_oversized_index() {
        assert_eq!(BufferRef::new(3, 0).unwrap_err().code(), "E002");
        assert_eq!(
            BufferRef::new(3, MAX_BUFFER_INDEX + 1).unwrap_err().code(),
            "E002"
        );
    }

    #[test]
    fn flag_helpers_return_new_values() {
        let r = BufferRef::new(2, 7).unwrap();
        let flagged = r.set_flag();
        assert!(!r.flag());
        assert!(flagged.flag());
        assert_eq!(flagged.clear_flag(), r);
        assert_eq!(flagged.bucket_index(), 2);
        assert_eq!(flagged.buffer_index(), 7);
    }

    #[test]
    fn bucket_zero_reports_invalid() {
        // Observed behaviour: validity is "bucket > 0", so real bucket-0 refs
        // look the same as an unset ref.
        let r = BufferRef::new(0, 1).unwrap();
        assert!(!r.is_valid());
        assert!(!BufferRef::default().is_valid());
        assert!(BufferRef::new(1, 1).unwrap().is_valid());
    }

    #[test]
    fn wire_layout() {
        let r = BufferRef::with_flag(15, MAX_BUFFER_INDEX, true).unwrap();
        assert_eq!(r.raw(), u32::MAX);
        let r = BufferRef::new(1, 1).unwrap();
        assert_eq!(r.raw(), 0x0800_0001);
        assert_eq!(r.to_le_bytes(), [0x01, 0x00, 0x00, 0x08]);
        assert_eq!(BufferRef::from_le_bytes(r.to_le_bytes()), r);
    }

    #[test]
    fn display() {
        let r = BufferRef::new(4, 12).unwrap();
        assert_eq!(r.to_string(), "b4:12");
        assert_eq!(r.set_flag().to_string(), "b4:12*");
    }
}
