//! Bucket storage: sparse, memory-mapped files of fixed-size slots.
//!
//! ```text
//! <store>/buckets/
//!   0/0  0/1 ...      bucket 0: file_slots slots of 2 KiB each
//!   1/0 ...           bucket 1: file_slots/2 slots of 4 KiB each
//!   ...
//! ```
//!
//! A [`BufferRef`](crate::types::BufferRef) maps to a file and offset by
//! arithmetic alone. Ownership of a slot is decided by the allocation table,
//! never by file locks.

mod file;
mod layout;
mod storage;

pub use file::BucketFile;
pub use layout::{
    BucketLayout, DEFAULT_FILE_SLOTS, DEFAULT_MIN_BUCKET_SIZE, DEFAULT_PAGE_SIZE,
    DISK_SPACE_MARGIN,
};
pub use storage::{BucketStorage, BufferRegion};
