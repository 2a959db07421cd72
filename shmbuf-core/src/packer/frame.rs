//! Persisted form of a packed block.
//!
//! ```text
//! ┌──────────────┬────────────────────────────────────────┐
//! │ crc32 (LE 4) │ lz4 block, uncompressed size prepended │
//! └──────────────┴────────────────────────────────────────┘
//! ```
//!
//! The checksum covers the compressed bytes.

use crate::error::{Result, StoreError};

const CRC_LEN: usize = 4;

/// Compress a block into a frame.
#[must_use]
pub fn pack_frame(block: &[u8]) -> Vec<u8> {
    let compressed = lz4_flex::compress_prepend_size(block);
    let crc = crc32fast::hash(&compressed);
    let mut frame = Vec::with_capacity(CRC_LEN + compressed.len());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(&compressed);
    frame
}

/// Verify and decompress a frame.
///
/// # Errors
/// `CorruptBlock` on a short frame, checksum mismatch, or invalid lz4 data.
pub fn unpack_frame(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < CRC_LEN {
        return Err(StoreError::CorruptBlock {
            cause: format!("frame of {} bytes is shorter than its checksum", frame.len()),
        });
    }
    let (crc_bytes, compressed) = frame.split_at(CRC_LEN);
    let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let actual = crc32fast::hash(compressed);
    if expected != actual {
        return Err(StoreError::CorruptBlock {
            cause: format!("checksum mismatch: stored {expected:08x}, computed {actual:08x}"),
        });
    }
    lz4_flex::decompress_size_prepended(compressed).map_err(|e| StoreError::CorruptBlock {
        cause: e.to_string(),
    })
}
