//! Integration tests for packing indexed blocks out of a store.

use shmbuf_core::packer::{
    BlockIndex, BlockStorage, IndexedBlock, LocalPackerLocks, MemoryBlockIndex,
    MemoryBlockStorage, unpack_frame,
};
use shmbuf_core::{BufferRef, BufferState, BufferStore, StoreConfig, StreamId};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{TempDir, tempdir};

struct Harness {
    _dir: TempDir,
    store: BufferStore,
    storage: Arc<MemoryBlockStorage>,
    index: Arc<MemoryBlockIndex>,
    locks: Arc<LocalPackerLocks>,
}

impl Harness {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::in_memory().with_directory(dir.path());
        config.packer.interval_ms = 10;
        config.packer.workers = 2;
        Self {
            store: BufferStore::open(config).unwrap(),
            _dir: dir,
            storage: Arc::new(MemoryBlockStorage::new()),
            index: Arc::new(MemoryBlockIndex::new()),
            locks: Arc::new(LocalPackerLocks::new()),
        }
    }

    fn publish(&self, stream: StreamId, version: u64, content: &[u8]) -> BufferRef {
        let mut buf = self.store.rent(content.len()).unwrap();
        buf.as_mut_slice()[..content.len()].copy_from_slice(content);
        let r = buf.seal_block();
        let count = self.store.pool().region(r).unwrap().header().mark_indexed(false);
        assert_eq!(count, 1);
        self.index.insert(IndexedBlock {
            stream,
            first_version: version,
            buffer_ref: r,
            len: content.len(),
        });
        r
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_pass_persists_and_recycles_blocks() {
    let h = Harness::new();
    let (orders, audit) = (StreamId::new(1), StreamId::new(2));
    h.publish(orders, 0, b"order 1; order 2");
    h.publish(orders, 2, b"order 3");
    h.publish(audit, 0, &[0xAB; 3000]);

    let packer = h
        .store
        .packer(h.storage.clone(), h.index.clone(), h.locks.clone());
    let stats = packer.run_pass().unwrap();
    assert_eq!(stats.streams, 2);
    assert_eq!(stats.packed, 3);
    assert!(stats.bytes_out < stats.bytes_in);

    assert!(h.index.pending_streams().unwrap().is_empty());
    let frame = h.storage.get_block(orders, 2).unwrap().unwrap();
    assert_eq!(unpack_frame(&frame).unwrap(), b"order 3");
    let frame = h.storage.get_block(audit, 0).unwrap().unwrap();
    assert_eq!(unpack_frame(&frame).unwrap(), vec![0xAB; 3000]);

    // Reclaimed buffers are still allocated, waiting in the pool cache.
    assert_eq!(h.store.pool().stats().cached, 3);
    assert_eq!(h.store.snapshot().unwrap().allocated_count(), 3);
    let reused = h.store.rent(10).unwrap();
    assert_eq!(h.store.pool().stats().cache_hits, 1);
    assert!(reused.header().load().is(BufferState::Owned));
}

#[test]
fn test_background_packer_waits_for_readers() {
    let h = Harness::new();
    let stream = StreamId::new(3);
    let r = h.publish(stream, 0, b"hot block");
    let reader = h.store.pool().open_block(r).unwrap().unwrap();

    let mut service = h
        .store
        .start_packer(h.storage.clone(), h.index.clone(), h.locks.clone())
        .unwrap();

    assert!(wait_until(|| h.storage.block_count(stream) == 1));
    assert!(wait_until(|| reader.header().load().is(BufferState::PackedStreamBlock)));
    // Persisted but still indexed and readable while pinned.
    assert_eq!(h.index.len(stream), 1);
    assert_eq!(&reader.as_slice()[..9], b"hot block");

    drop(reader);
    assert!(wait_until(|| h.index.is_empty(stream)));
    assert!(wait_until(|| service.stats().packed == 1));
    service.stop();

    assert!(service.stats().deferred >= 1);
    assert!(h.store.pool().open_block(r).unwrap().is_none());
}

#[test]
fn test_history_free_streams_are_dropped() {
    let h = Harness::new();
    let stream = StreamId::new(4);
    h.index.set_retains_history(stream, false);
    for v in 0..5 {
        h.publish(stream, v * 10, b"ephemeral");
    }

    let stats = h
        .store
        .packer(h.storage.clone(), h.index.clone(), h.locks.clone())
        .run_pass()
        .unwrap();
    assert_eq!(stats.deleted, 5);
    assert_eq!(h.storage.last_version(stream).unwrap(), None);
    assert!(h.index.is_empty(stream));
}
