//! Core types for shmbuf.
//!
//! - `BufferRef`: packed 32-bit identifier of a physical buffer
//! - `InstanceId`: identifier of the process that owns a buffer
//! - `StreamId`: identifier of a stream whose blocks the packer reclaims

mod buffer_ref;
mod ids;

pub use buffer_ref::{
    BUFFER_INDEX_MASK, BufferRef, FLAG_MASK, MAX_BUCKET_INDEX, MAX_BUFFER_INDEX,
};
pub use ids::{InstanceId, StreamId};
