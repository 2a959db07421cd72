//! Prelude for convenient imports.
//!
//! ```ignore
//! use shmbuf_core::prelude::*;
//! ```

// Identifiers
pub use crate::types::{BufferRef, InstanceId, StreamId};

// Error handling
pub use crate::error::{Result, StoreError};

// Configuration
pub use crate::config::{AllocatorConfig, LayoutConfig, PackerConfig, PoolConfig, StoreConfig};

// Store and pool
pub use crate::pool::{BlockReader, BufferPool, PoolStats, RentedBuffer};
pub use crate::store::BufferStore;

// Allocation
pub use crate::allocator::{AllocationSnapshot, Allocator};

// Header
pub use crate::header::{BufferHeader, BufferState};

// Packer
pub use crate::packer::{
    BlockIndex, BlockStorage, IndexedBlock, LocalPackerLocks, MemoryBlockIndex,
    MemoryBlockStorage, PackStats, Packer, PackerLocks, PackerService,
};
