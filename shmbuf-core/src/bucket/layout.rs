//! Size classes and slot arithmetic.

use crate::error::{Result, StoreError};
use crate::header::HEADER_SIZE;
use crate::types::{BufferRef, MAX_BUCKET_INDEX};

/// Default page size.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Default size of bucket 0.
pub const DEFAULT_MIN_BUCKET_SIZE: u64 = 2048;

/// Default number of bucket-0 slots per file; bucket `k` gets `>> k`.
pub const DEFAULT_FILE_SLOTS: u64 = 1 << 15;

/// Free disk space required when creating a file, as a multiple of its length.
pub const DISK_SPACE_MARGIN: u64 = 2;

/// Geometry shared by every process attached to a store.
///
/// Slot layout within a bucket file:
///
/// ```text
/// small    ┌──────────────┬───────────────────────────────┐
///          │ header (8 B) │ payload (base - 8)            │
///          └──────────────┴───────────────────────────────┘
///
/// pow2     ┌────────────────────────┬──────────────┬──────────────────────┐
///          │ unused (page - 8)      │ header (8 B) │ payload (base)       │
///          └────────────────────────┴──────────────┴──────────────────────┘
/// ```
///
/// Buckets at or above the pow2 threshold add one page to the slot. The
/// header sits at the end of that page, so the payload is exactly the
/// power-of-two size and starts on a page boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLayout {
    page_size: u64,
    min_bucket_size: u64,
    pow2_threshold: u64,
    max_bucket_index: u8,
    file_slots: u64,
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_bucket_size: DEFAULT_MIN_BUCKET_SIZE,
            pow2_threshold: 2 * DEFAULT_PAGE_SIZE,
            max_bucket_index: MAX_BUCKET_INDEX,
            file_slots: DEFAULT_FILE_SLOTS,
        }
    }
}

impl BucketLayout {
    /// Build a layout, validating every field.
    ///
    /// # Errors
    /// Returns `StoreError::ConfigValue` for sizes that are not powers of two,
    /// a minimum bucket smaller than two headers, a pow2 threshold below the
    /// page size, a zero slot constant, a maximum bucket above 15, or a
    /// geometry whose slot or file lengths overflow.
    pub fn new(
        page_size: u64,
        min_bucket_size: u64,
        pow2_threshold: u64,
        max_bucket_index: u8,
        file_slots: u64,
    ) -> Result<Self> {
        let invalid = |field: &str, cause: String| StoreError::ConfigValue {
            field: field.to_string(),
            cause,
        };
        if !page_size.is_power_of_two() || page_size < HEADER_SIZE as u64 {
            return Err(invalid(
                "layout.page_size",
                format!("{page_size} is not a power of two >= {HEADER_SIZE}"),
            ));
        }
        if !min_bucket_size.is_power_of_two() || min_bucket_size < 2 * HEADER_SIZE as u64 {
            return Err(invalid(
                "layout.min_bucket_size",
                format!("{min_bucket_size} is not a power of two >= {}", 2 * HEADER_SIZE),
            ));
        }
        if pow2_threshold < page_size {
            return Err(invalid(
                "layout.pow2_threshold",
                format!("{pow2_threshold} is below the page size {page_size}"),
            ));
        }
        if max_bucket_index > MAX_BUCKET_INDEX {
            return Err(invalid(
                "layout.max_bucket_index",
                format!("{max_bucket_index} exceeds {MAX_BUCKET_INDEX}"),
            ));
        }
        if file_slots == 0 {
            return Err(invalid("layout.file_slots", "must be non-zero".to_string()));
        }
        if u32::from(max_bucket_index) > min_bucket_size.leading_zeros()
            || (min_bucket_size << max_bucket_index) > u64::MAX - page_size
        {
            return Err(invalid(
                "layout.min_bucket_size",
                format!("{min_bucket_size} << {max_bucket_index} overflows a slot length"),
            ));
        }
        let layout = Self {
            page_size,
            min_bucket_size,
            pow2_threshold,
            max_bucket_index,
            file_slots,
        };
        for bucket in 0..=max_bucket_index {
            let fits = layout
                .slot_len(bucket)
                .checked_mul(layout.slots_per_file(bucket))
                .is_some_and(|len| usize::try_from(len).is_ok());
            if !fits {
                return Err(invalid(
                    "layout.file_slots",
                    format!("bucket {bucket} file length overflows"),
                ));
            }
        }
        Ok(layout)
    }

    /// Page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Highest bucket index in use.
    #[must_use]
    pub fn max_bucket_index(&self) -> u8 {
        self.max_bucket_index
    }

    /// Power-of-two size of bucket `k`.
    #[must_use]
    pub fn base_size(&self, bucket: u8) -> u64 {
        self.min_bucket_size << bucket
    }

    /// Whether bucket `k` is laid out in pow2 mode.
    #[must_use]
    pub fn is_pow2(&self, bucket: u8) -> bool {
        self.base_size(bucket) >= self.pow2_threshold
    }

    /// Bytes occupied by one slot, header included.
    #[must_use]
    pub fn slot_len(&self, bucket: u8) -> u64 {
        let base = self.base_size(bucket);
        if self.is_pow2(bucket) {
            base + self.page_size
        } else {
            base
        }
    }

    /// Offset of the header within a slot of bucket `k`.
    #[must_use]
    pub fn header_offset(&self, bucket: u8) -> u64 {
        if self.is_pow2(bucket) {
            self.page_size - HEADER_SIZE as u64
        } else {
            0
        }
    }

    /// Offset of the payload within a slot of bucket `k`.
    #[must_use]
    pub fn payload_offset(&self, bucket: u8) -> u64 {
        self.header_offset(bucket) + HEADER_SIZE as u64
    }

    /// Bytes available to the consumer in one slot.
    #[must_use]
    pub fn payload_len(&self, bucket: u8) -> usize {
        (self.slot_len(bucket) - self.payload_offset(bucket)) as usize
    }

    /// Largest payload any configured bucket offers.
    #[must_use]
    pub fn max_payload_len(&self) -> usize {
        self.payload_len(self.max_bucket_index)
    }

    /// Slots in each file of bucket `k`.
    #[must_use]
    pub fn slots_per_file(&self, bucket: u8) -> u64 {
        (self.file_slots >> bucket).max(1)
    }

    /// Length of one file of bucket `k`.
    #[must_use]
    pub fn file_len(&self, bucket: u8) -> u64 {
        self.slot_len(bucket) * self.slots_per_file(bucket)
    }

    /// File index and byte offset of the slot named by `r`.
    ///
    /// `r` must have a buffer index of at least 1.
    #[must_use]
    pub fn locate(&self, r: BufferRef) -> (usize, u64) {
        let bucket = r.bucket_index();
        let slot = u64::from(r.buffer_index()).wrapping_sub(1);
        let per_file = self.slots_per_file(bucket);
        let file_index = (slot / per_file) as usize;
        let offset = (slot % per_file) * self.slot_len(bucket);
        (file_index, offset)
    }

    /// Validate a ref against this layout.
    ///
    /// # Errors
    /// `InvalidBucketIndex` when the bucket exceeds the configured maximum,
    /// `InvalidBufferIndex` for the reserved index 0.
    pub fn check(&self, r: BufferRef) -> Result<()> {
        self.check_bucket(r.bucket_index())?;
        if r.buffer_index() == 0 {
            return Err(StoreError::InvalidBufferIndex {
                index: 0,
                max: crate::types::MAX_BUFFER_INDEX,
            });
        }
        Ok(())
    }

    /// Validate a bucket index against this layout.
    ///
    /// # Errors
    /// `InvalidBucketIndex` when `bucket` exceeds the configured maximum.
    pub fn check_bucket(&self, bucket: u8) -> Result<()> {
        if bucket > self.max_bucket_index {
            return Err(StoreError::InvalidBucketIndex {
                bucket: u32::from(bucket),
                max: u32::from(self.max_bucket_index),
            });
        }
        Ok(())
    }
}
