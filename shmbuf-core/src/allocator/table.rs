//! The durable allocation table.

use crate::bucket::BucketLayout;
use crate::error::{Result, StoreError};
use crate::types::BufferRef;
use heed::byteorder::BigEndian;
use heed::types::U32;
use heed::{Database, DatabaseFlags, Env, EnvFlags, EnvOpenOptions, RoTxn, RwTxn};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name of the table of live buffers.
pub const ALLOCATED_TABLE: &str = "allocated";

/// Name of the free list.
pub const FREE_TABLE: &str = "free";

/// Default map size of the table environment: 1 GiB.
pub const DEFAULT_TABLE_MAP_SIZE: usize = 1 << 30;

/// Bucket index → duplicate-sorted raw refs.
///
/// Both key and value are big-endian, so the duplicates of one bucket sort
/// by buffer index and the first duplicate is the lowest index.
pub type RefTable = Database<U32<BigEndian>, U32<BigEndian>>;

/// An LMDB environment holding the `allocated` and `free` tables.
///
/// Cloning is cheap and shares the environment; every clone sees the same
/// transactions, as does every other process opening the same directory.
#[derive(Clone)]
pub struct AllocationTable {
    env: Env,
    allocated: RefTable,
    free: RefTable,
    path: PathBuf,
}

impl AllocationTable {
    /// Open (or create) the environment in `dir`.
    ///
    /// The environment runs with `NO_SYNC`; callers decide when to force a
    /// sync.
    pub fn open(dir: &Path, map_size: usize) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::TableOpen {
            path: dir.to_path_buf(),
            cause: e.to_string(),
        })?;

        let open_err = |e: heed::Error| StoreError::TableOpen {
            path: dir.to_path_buf(),
            cause: e.to_string(),
        };

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(2)
                .flags(EnvFlags::NO_SYNC)
                .open(dir)
        }
        .map_err(open_err)?;

        let mut wtxn = env.write_txn().map_err(open_err)?;
        let allocated = Self::create_table(&env, &mut wtxn, ALLOCATED_TABLE).map_err(open_err)?;
        let free = Self::create_table(&env, &mut wtxn, FREE_TABLE).map_err(open_err)?;
        wtxn.commit().map_err(open_err)?;

        tracing::info!(path = %dir.display(), map_size, "Opened allocation table");

        Ok(Self {
            env,
            allocated,
            free,
            path: dir.to_path_buf(),
        })
    }

    fn create_table(env: &Env, wtxn: &mut RwTxn<'_>, name: &str) -> heed::Result<RefTable> {
        env.database_options()
            .types::<U32<BigEndian>, U32<BigEndian>>()
            .flags(DatabaseFlags::DUP_SORT | DatabaseFlags::DUP_FIXED)
            .name(name)
            .create(wtxn)
    }

    /// The underlying environment.
    #[must_use]
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Directory of the environment.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Table of live buffers.
    #[must_use]
    pub fn allocated(&self) -> RefTable {
        self.allocated
    }

    /// The free list.
    #[must_use]
    pub fn free(&self) -> RefTable {
        self.free
    }

    /// Run `f` in a write transaction, committing on success and aborting on
    /// any error.
    pub fn write<T>(&self, f: impl FnOnce(&mut RwTxn<'_>) -> Result<T>) -> Result<T> {
        let mut wtxn = self.env.write_txn()?;
        match f(&mut wtxn) {
            Ok(value) => {
                wtxn.commit()?;
                Ok(value)
            }
            Err(e) => {
                wtxn.abort();
                Err(e)
            }
        }
    }

    /// Run `f` in a read transaction.
    pub fn read<T>(&self, f: impl FnOnce(&RoTxn<'_>) -> Result<T>) -> Result<T> {
        let rtxn = self.env.read_txn()?;
        f(&rtxn)
    }

    /// Force the environment to disk.
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }

    /// Lowest free ref of `bucket`.
    pub fn first_free(&self, txn: &RoTxn<'_>, bucket: u8) -> Result<Option<BufferRef>> {
        Ok(self
            .free
            .get(txn, &u32::from(bucket))?
            .map(BufferRef::from_raw))
    }

    /// Highest allocated ref of `bucket`.
    pub fn last_allocated(&self, txn: &RoTxn<'_>, bucket: u8) -> Result<Option<BufferRef>> {
        let mut last = None;
        if let Some(iter) = self.allocated.get_duplicates(txn, &u32::from(bucket))? {
            for item in iter {
                let (_, raw) = item?;
                last = Some(BufferRef::from_raw(raw));
            }
        }
        Ok(last)
    }

    /// Whether `table` holds `r` under its bucket.
    pub fn contains(&self, txn: &RoTxn<'_>, table: RefTable, r: BufferRef) -> Result<bool> {
        let raw = r.raw();
        if let Some(iter) = table.get_duplicates(txn, &u32::from(r.bucket_index()))? {
            for item in iter {
                let (_, value) = item?;
                if value == raw {
                    return Ok(true);
                }
                if value > raw {
                    break;
                }
            }
        }
        Ok(false)
    }

    /// Number of allocated refs in `bucket`.
    pub fn allocated_count(&self, txn: &RoTxn<'_>, bucket: u8) -> Result<u64> {
        let mut count = 0;
        if let Some(iter) = self.allocated.get_duplicates(txn, &u32::from(bucket))? {
            for item in iter {
                item?;
                count += 1;
            }
        }
        Ok(count)
    }

    /// Bytes held by allocated buffers across every bucket of `layout`.
    pub fn allocated_bytes(&self, txn: &RoTxn<'_>, layout: &BucketLayout) -> Result<u64> {
        let mut total = 0u64;
        for bucket in 0..=layout.max_bucket_index() {
            total += self.allocated_count(txn, bucket)? * layout.slot_len(bucket);
        }
        Ok(total)
    }

    /// Every ref in `table`, grouped by bucket.
    pub fn collect(&self, txn: &RoTxn<'_>, table: RefTable) -> Result<BTreeMap<u8, Vec<BufferRef>>> {
        let mut out: BTreeMap<u8, Vec<BufferRef>> = BTreeMap::new();
        for item in table.iter(txn)? {
            let (bucket, raw) = item?;
            out.entry(bucket as u8)
                .or_default()
                .push(BufferRef::from_raw(raw));
        }
        Ok(out)
    }

    /// Move `r` from the allocated table to the free list.
    ///
    /// Returns `false` and changes nothing if `r` is not allocated.
    pub fn move_to_free(&self, wtxn: &mut RwTxn<'_>, r: BufferRef) -> Result<bool> {
        let key = u32::from(r.bucket_index());
        let raw = r.raw();
        if !self.allocated.delete_one_duplicate(wtxn, &key, &raw)? {
            return Ok(false);
        }
        self.free.put(wtxn, &key, &raw)?;
        Ok(true)
    }

    /// Move `r` from the free list to the allocated table.
    pub fn take_free(&self, wtxn: &mut RwTxn<'_>, r: BufferRef) -> Result<()> {
        let key = u32::from(r.bucket_index());
        let raw = r.raw();
        if !self.free.delete_one_duplicate(wtxn, &key, &raw)? {
            return Err(StoreError::Transaction {
                cause: format!("{r} vanished from the free list"),
            });
        }
        self.allocated.put(wtxn, &key, &raw)?;
        Ok(())
    }

    /// Record a newly synthesized ref as allocated.
    pub fn insert_allocated(&self, wtxn: &mut RwTxn<'_>, r: BufferRef) -> Result<()> {
        self.allocated
            .put(wtxn, &u32::from(r.bucket_index()), &r.raw())?;
        Ok(())
    }
}

impl std::fmt::Debug for AllocationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationTable")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
