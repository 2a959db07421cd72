//! Store facade: one directory, one configuration.
//!
//! ```text
//! <directory>/
//!   table/            allocation table environment
//!   buckets/<k>/<n>   bucket files
//! ```

use crate::allocator::{AllocationSnapshot, AllocationTable, Allocator};
use crate::bucket::BucketStorage;
use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::packer::{BlockIndex, BlockStorage, Packer, PackerLocks, PackerService};
use crate::pool::{BufferPool, RentedBuffer};
use crate::types::{BufferRef, InstanceId};
use std::sync::Arc;

/// An opened buffer store.
pub struct BufferStore {
    config: StoreConfig,
    allocator: Arc<Allocator>,
    pool: BufferPool,
}

impl BufferStore {
    /// Open (or create) the store described by `config`.
    ///
    /// # Errors
    /// `ConfigValue` for an invalid configuration, `Io` if the directory
    /// cannot be created, and `TableOpen` if the allocation table cannot be
    /// opened.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        let buckets_dir = config.buckets_dir();
        std::fs::create_dir_all(&buckets_dir).map_err(|e| StoreError::Io {
            path: buckets_dir.clone(),
            cause: e.to_string(),
        })?;

        let layout = config.layout.to_layout()?;
        let table = AllocationTable::open(&config.table_dir(), config.allocator.table_map_size)?;
        let storage = Arc::new(BucketStorage::new(buckets_dir, layout));
        let owner = config.instance();
        let allocator = Arc::new(Allocator::new(table, storage, owner, &config.allocator));
        let pool = BufferPool::new(Arc::clone(&allocator), &config.pool);

        tracing::info!(
            directory = %config.directory.display(),
            instance = %owner,
            budget = config.allocator.max_total_bytes,
            "Opened buffer store"
        );

        Ok(Self {
            config,
            allocator,
            pool,
        })
    }

    /// The configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// This process's instance id.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.allocator.owner()
    }

    /// The per-process pool.
    #[must_use]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The allocator.
    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// Rent a buffer from the pool.
    pub fn rent(&self, min_size: usize) -> Result<RentedBuffer> {
        self.pool.rent(min_size)
    }

    /// Copy of the allocated and free lists.
    pub fn snapshot(&self) -> Result<AllocationSnapshot> {
        self.allocator.snapshot()
    }

    /// Human-readable dump of the allocation table.
    pub fn dump(&self) -> Result<String> {
        self.allocator.dump()
    }

    /// Return one stranded buffer to the free list.
    pub fn retry_return(&self, r: BufferRef) -> Result<bool> {
        self.allocator.retry_return(r)
    }

    /// Return every stranded buffer, optionally only those of one instance.
    pub fn repair(&self, owner: Option<InstanceId>) -> Result<Vec<BufferRef>> {
        self.allocator.repair_all(owner)
    }

    /// Build a packer that reclaims into this store's pool.
    pub fn packer(
        &self,
        storage: Arc<dyn BlockStorage>,
        index: Arc<dyn BlockIndex>,
        locks: Arc<dyn PackerLocks>,
    ) -> Packer {
        Packer::new(self.pool.clone(), storage, index, locks, &self.config.packer)
    }

    /// Start a background packer with the configured workers and interval.
    pub fn start_packer(
        &self,
        storage: Arc<dyn BlockStorage>,
        index: Arc<dyn BlockIndex>,
        locks: Arc<dyn PackerLocks>,
    ) -> Result<PackerService> {
        let packer = Arc::new(self.packer(storage, index, locks));
        PackerService::start(packer, &self.config.packer)
    }
}

impl std::fmt::Debug for BufferStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferStore")
            .field("directory", &self.config.directory)
            .field("instance", &self.instance())
            .field("pool", &self.pool)
            .finish()
    }
}
