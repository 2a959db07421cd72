//! In-process implementations of the packer's collaborators.

use super::traits::{BlockIndex, BlockStorage, IndexedBlock, PackerLocks};
use crate::error::Result;
use crate::types::{InstanceId, StreamId};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

/// Block storage held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlockStorage {
    blocks: RwLock<HashMap<StreamId, BTreeMap<u64, Vec<u8>>>>,
}

impl MemoryBlockStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames stored for `stream`.
    #[must_use]
    pub fn block_count(&self, stream: StreamId) -> usize {
        self.blocks.read().get(&stream).map_or(0, BTreeMap::len)
    }
}

impl BlockStorage for MemoryBlockStorage {
    fn put_block(&self, stream: StreamId, first_version: u64, frame: Vec<u8>) -> Result<()> {
        self.blocks
            .write()
            .entry(stream)
            .or_default()
            .insert(first_version, frame);
        Ok(())
    }

    fn get_block(&self, stream: StreamId, first_version: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blocks
            .read()
            .get(&stream)
            .and_then(|b| b.get(&first_version).cloned()))
    }

    fn last_version(&self, stream: StreamId) -> Result<Option<u64>> {
        Ok(self
            .blocks
            .read()
            .get(&stream)
            .and_then(|b| b.keys().next_back().copied()))
    }
}

/// Block index held in memory.
#[derive(Debug, Default)]
pub struct MemoryBlockIndex {
    streams: Mutex<BTreeMap<StreamId, BTreeMap<u64, IndexedBlock>>>,
    no_history: Mutex<HashSet<StreamId>>,
}

impl MemoryBlockIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a block discoverable. The block's header must already be in
    /// the indexed state.
    pub fn insert(&self, block: IndexedBlock) {
        self.streams
            .lock()
            .entry(block.stream)
            .or_default()
            .insert(block.first_version, block);
    }

    /// Choose whether `stream` keeps its history in block storage.
    pub fn set_retains_history(&self, stream: StreamId, retain: bool) {
        let mut no_history = self.no_history.lock();
        if retain {
            no_history.remove(&stream);
        } else {
            no_history.insert(stream);
        }
    }

    /// Indexed blocks of `stream`.
    #[must_use]
    pub fn len(&self, stream: StreamId) -> usize {
        self.streams.lock().get(&stream).map_or(0, BTreeMap::len)
    }

    /// Whether `stream` has no indexed blocks.
    #[must_use]
    pub fn is_empty(&self, stream: StreamId) -> bool {
        self.len(stream) == 0
    }
}

impl BlockIndex for MemoryBlockIndex {
    fn pending_streams(&self) -> Result<Vec<StreamId>> {
        Ok(self
            .streams
            .lock()
            .iter()
            .filter(|(_, blocks)| !blocks.is_empty())
            .map(|(stream, _)| *stream)
            .collect())
    }

    fn next_block(&self, stream: StreamId) -> Result<Option<IndexedBlock>> {
        Ok(self
            .streams
            .lock()
            .get(&stream)
            .and_then(|b| b.values().next().copied()))
    }

    fn remove(&self, stream: StreamId, first_version: u64) -> Result<()> {
        let mut streams = self.streams.lock();
        if let Some(blocks) = streams.get_mut(&stream) {
            blocks.remove(&first_version);
            if blocks.is_empty() {
                streams.remove(&stream);
            }
        }
        Ok(())
    }

    fn retains_history(&self, stream: StreamId) -> bool {
        !self.no_history.lock().contains(&stream)
    }
}

/// Packer leases held in process memory.
#[derive(Debug, Default)]
pub struct LocalPackerLocks {
    leases: Mutex<HashMap<StreamId, (InstanceId, Instant)>>,
}

impl LocalPackerLocks {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `stream`'s unexpired lease.
    #[must_use]
    pub fn holder(&self, stream: StreamId) -> Option<InstanceId> {
        self.leases
            .lock()
            .get(&stream)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(holder, _)| *holder)
    }
}

impl PackerLocks for LocalPackerLocks {
    fn try_acquire(&self, stream: StreamId, holder: InstanceId, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get(&stream) {
            Some((current, expires)) if *current != holder && *expires > now => Ok(false),
            _ => {
                leases.insert(stream, (holder, now + lease));
                Ok(true)
            }
        }
    }

    fn renew(&self, stream: StreamId, holder: InstanceId, lease: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        match leases.get_mut(&stream) {
            Some((current, expires)) if *current == holder => {
                *expires = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, stream: StreamId, holder: InstanceId) -> Result<()> {
        let mut leases = self.leases.lock();
        if leases.get(&stream).is_some_and(|(current, _)| *current == holder) {
            leases.remove(&stream);
        }
        Ok(())
    }
}
