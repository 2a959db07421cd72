//! Request size to bucket selection.

use crate::bucket::BucketLayout;
use crate::error::{Result, StoreError};

/// Maps a requested payload size to the smallest bucket that holds it.
///
/// Below the pow2 threshold a bucket's payload is its slot minus the header;
/// at or above it the payload is exactly `min << k`. A request lands in the
/// smallest `k` whose payload holds it.
#[derive(Debug, Clone)]
pub struct SizePolicy {
    layout: BucketLayout,
}

impl SizePolicy {
    /// Create a policy over `layout`.
    pub fn new(layout: BucketLayout) -> Self {
        Self { layout }
    }

    /// Smallest bucket whose payload holds `min_size` bytes.
    ///
    /// # Errors
    /// `RequestTooLarge` when no configured bucket is big enough.
    pub fn bucket_for(&self, min_size: usize) -> Result<u8> {
        (0..=self.layout.max_bucket_index())
            .find(|&k| self.layout.payload_len(k) >= min_size)
            .ok_or(StoreError::RequestTooLarge {
                requested: min_size,
                max: self.layout.max_payload_len(),
            })
    }

    /// The layout the policy selects from.
    #[must_use]
    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_examples() {
        let policy = SizePolicy::new(BucketLayout::default());
        assert_eq!(policy.bucket_for(100).unwrap(), 0);
        assert_eq!(policy.bucket_for(3000).unwrap(), 1);
        // Bucket 3 offers exactly 16384 bytes; 20000 needs bucket 4.
        assert_eq!(policy.bucket_for(16_384).unwrap(), 3);
        assert_eq!(policy.bucket_for(16_385).unwrap(), 4);
        assert_eq!(policy.bucket_for(20_000).unwrap(), 4);
    }

    #[test]
    fn header_counts_against_the_slot() {
        let policy = SizePolicy::new(BucketLayout::default());
        assert_eq!(policy.bucket_for(2040).unwrap(), 0);
        assert_eq!(policy.bucket_for(2041).unwrap(), 1);
        assert_eq!(policy.bucket_for(0).unwrap(), 0);
    }

    #[test]
    fn pow2_buckets_keep_full_power_of_two_payload() {
        let layout = BucketLayout::default();
        let policy = SizePolicy::new(layout.clone());
        for k in 2..=15u8 {
            let base = layout.base_size(k) as usize;
            assert_eq!(policy.bucket_for(base).unwrap(), k);
            if k < 15 {
                assert_eq!(policy.bucket_for(base + 1).unwrap(), k + 1);
            }
        }
        assert!(policy.bucket_for(layout.max_payload_len() + 1).is_err());
    }

    #[test]
    fn too_large_is_a_capacity_error() {
        let layout = BucketLayout::new(4096, 2048, 8192, 2, 16).unwrap();
        let policy = SizePolicy::new(layout);
        let err = policy.bucket_for(1 << 20).unwrap_err();
        assert!(err.is_capacity_error());
        assert_eq!(err.code(), "E204");
    }
}
