//! shmbuf Core Library
//!
//! A buffer pool shared between processes on one host. Buffers live in
//! memory-mapped bucket files; which buffers are in use is recorded in a
//! transactional allocation table, so every attached process sees the same
//! allocated and free lists.
//!
//! # Key Components
//!
//! - **BufferRef**: 32-bit identifier of a buffer (bucket + index + flag)
//! - **Header**: 8-byte atomic word at the start of every buffer holding its
//!   lifecycle state, reference count and owning instance
//! - **Bucket storage**: sparse, lazily mapped files per size class
//! - **Allocator**: allocate/free against the allocation table, with a
//!   capacity budget
//! - **Pool**: per-process cache of owned buffers
//! - **Packer**: compresses indexed stream blocks and reclaims their buffers
//!
//! # Example
//!
//! ```ignore
//! use shmbuf_core::prelude::*;
//!
//! let store = BufferStore::open(StoreConfig::in_memory())?;
//! let mut buf = store.rent(1000)?;
//! buf.as_mut_slice()[..5].copy_from_slice(b"hello");
//! drop(buf); // back to the pool cache
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod bucket;
pub mod config;
pub mod error;
pub mod header;
pub mod packer;
pub mod pool;
pub mod prelude;
pub mod store;
pub mod types;

// Re-export key types at crate root for convenience
pub use allocator::{AllocationSnapshot, AllocationTable, Allocator};
pub use bucket::{BucketLayout, BucketStorage, BufferRegion};
pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use header::{BufferHeader, BufferState, HeaderWord};
pub use packer::{Packer, PackerService};
pub use pool::{BlockReader, BufferPool, RentedBuffer};
pub use store::BufferStore;
pub use types::{BufferRef, InstanceId, StreamId};
