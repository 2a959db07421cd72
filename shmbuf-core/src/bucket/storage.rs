//! Lazily grown map from buffer refs to mapped memory.

use super::file::BucketFile;
use super::layout::BucketLayout;
use crate::error::Result;
use crate::header::BufferHeader;
use crate::types::BufferRef;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type FileTable = RwLock<Vec<Option<Arc<BucketFile>>>>;

/// Resolves [`BufferRef`]s to memory in `buckets/<bucket>/<file>`.
///
/// Files are created on first access. Lookups take a read lock on the
/// bucket's file table; creation is serialized by a single mutex.
pub struct BucketStorage {
    root: PathBuf,
    layout: BucketLayout,
    buckets: Vec<FileTable>,
    create_lock: Mutex<()>,
}

impl BucketStorage {
    /// Create storage rooted at `root` (usually `<store>/buckets`).
    pub fn new(root: impl Into<PathBuf>, layout: BucketLayout) -> Self {
        let buckets = (0..=layout.max_bucket_index())
            .map(|_| RwLock::new(Vec::new()))
            .collect();
        Self {
            root: root.into(),
            layout,
            buckets,
            create_lock: Mutex::new(()),
        }
    }

    /// The layout used by this storage.
    #[must_use]
    pub fn layout(&self) -> &BucketLayout {
        &self.layout
    }

    /// Root directory of the bucket tree.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a ref after validating its bucket and index.
    ///
    /// # Errors
    /// Range errors for refs outside the layout, and file or disk-space
    /// errors when the backing file has to be created.
    pub fn region(&self, r: BufferRef) -> Result<BufferRegion> {
        self.layout.check(r)?;
        // SAFETY: validated above.
        unsafe { self.region_unchecked(r) }
    }

    /// Resolve a ref without validating it.
    ///
    /// # Safety
    /// `r` must name a bucket within the layout and a buffer index of at
    /// least 1, as is the case for every ref issued by the allocator.
    ///
    /// # Errors
    /// File or disk-space errors when the backing file has to be created.
    pub unsafe fn region_unchecked(&self, r: BufferRef) -> Result<BufferRegion> {
        let bucket = r.bucket_index();
        let (file_index, offset) = self.layout.locate(r);
        // SAFETY: the caller guarantees `bucket <= max_bucket_index`.
        let table = unsafe { self.buckets.get_unchecked(bucket as usize) };
        let file = self.file(table, bucket, file_index)?;
        Ok(BufferRegion {
            buffer_ref: r,
            file,
            header_offset: (offset + self.layout.header_offset(bucket)) as usize,
            data_offset: (offset + self.layout.payload_offset(bucket)) as usize,
            data_len: self.layout.payload_len(bucket),
        })
    }

    /// Number of files currently mapped for `bucket`.
    #[must_use]
    pub fn mapped_files(&self, bucket: u8) -> usize {
        self.buckets
            .get(bucket as usize)
            .map(|t| t.read().iter().filter(|f| f.is_some()).count())
            .unwrap_or(0)
    }

    /// Path of file `file_index` of `bucket`.
    #[must_use]
    pub fn file_path(&self, bucket: u8, file_index: usize) -> PathBuf {
        self.root.join(bucket.to_string()).join(file_index.to_string())
    }

    fn file(&self, table: &FileTable, bucket: u8, file_index: usize) -> Result<Arc<BucketFile>> {
        if let Some(Some(file)) = table.read().get(file_index) {
            return Ok(Arc::clone(file));
        }

        let _guard = self.create_lock.lock();
        if let Some(Some(file)) = table.read().get(file_index) {
            return Ok(Arc::clone(file));
        }

        let path = self.file_path(bucket, file_index);
        let file = Arc::new(BucketFile::open_or_create(
            &path,
            self.layout.file_len(bucket),
        )?);

        let mut files = table.write();
        if files.len() <= file_index {
            files.resize(file_index + 1, None);
        }
        files[file_index] = Some(Arc::clone(&file));
        Ok(file)
    }
}

impl std::fmt::Debug for BucketStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketStorage")
            .field("root", &self.root)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// One buffer slot: its header and payload.
///
/// Holds the backing file, so the mapping stays valid while the region lives.
#[derive(Clone)]
pub struct BufferRegion {
    buffer_ref: BufferRef,
    file: Arc<BucketFile>,
    header_offset: usize,
    data_offset: usize,
    data_len: usize,
}

impl BufferRegion {
    /// The ref this region was resolved from.
    #[must_use]
    pub fn buffer_ref(&self) -> BufferRef {
        self.buffer_ref
    }

    /// The slot's atomic header.
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        // SAFETY: slot lengths and the pow2 header offset are multiples of 8
        // within a page-aligned mapping, so the header is 8-byte aligned, and
        // the mapping lives as long as `self.file`.
        unsafe { BufferHeader::from_ptr(self.file.ptr_at(self.header_offset)) }
    }

    /// Pointer to the first payload byte.
    ///
    /// Page-aligned for pow2 buckets.
    #[must_use]
    pub fn data_ptr(&self) -> *mut u8 {
        // SAFETY: every payload starts strictly inside its slot.
        unsafe { self.file.ptr_at(self.data_offset) }
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// The payload as a shared slice.
    ///
    /// # Safety
    /// The caller must hold a header state that excludes concurrent writers.
    #[must_use]
    pub unsafe fn data(&self) -> &[u8] {
        // SAFETY: the payload range lies inside the mapping.
        unsafe { std::slice::from_raw_parts(self.data_ptr(), self.data_len()) }
    }

    /// The payload as a mutable slice.
    ///
    /// # Safety
    /// The caller must exclusively own the buffer (owned state) and must not
    /// create overlapping slices.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub unsafe fn data_mut(&self) -> &mut [u8] {
        // SAFETY: the payload range lies inside the mapping.
        unsafe { std::slice::from_raw_parts_mut(self.data_ptr(), self.data_len()) }
    }
}

impl std::fmt::Debug for BufferRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferRegion")
            .field("buffer_ref", &self.buffer_ref)
            .field("file", &self.file.path())
            .field("header_offset", &self.header_offset)
            .field("header", self.header())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{BufferState, HeaderWord};
    use crate::types::InstanceId;
    use tempfile::tempdir;

    fn small_layout() -> BucketLayout {
        BucketLayout::new(4096, 2048, 8192, 3, 4).unwrap()
    }

    #[test]
    fn regions_are_lazily_backed() {
        let dir = tempdir().unwrap();
        let storage = BucketStorage::new(dir.path(), small_layout());
        assert_eq!(storage.mapped_files(0), 0);

        let region = storage.region(BufferRef::new(0, 6).unwrap()).unwrap();
        assert_eq!(region.data_len(), 2040);
        assert_eq!(storage.mapped_files(0), 1);
        assert!(dir.path().join("0").join("1").exists());
        assert!(!dir.path().join("0").join("0").exists());
    }

    #[test]
    fn header_and_payload_do_not_overlap() {
        let dir = tempdir().unwrap();
        let storage = BucketStorage::new(dir.path(), small_layout());
        let a = storage.region(BufferRef::new(1, 1).unwrap()).unwrap();
        let b = storage.region(BufferRef::new(1, 2).unwrap()).unwrap();

        a.header().init_fresh(InstanceId::new(1));
        unsafe { a.data_mut().fill(0xFF) };
        assert_eq!(b.header().load(), HeaderWord::ZERO);
        assert!(a.header().load().is(BufferState::ReleasingDisposed));
    }

    #[test]
    fn views_share_memory() {
        let dir = tempdir().unwrap();
        let one = BucketStorage::new(dir.path(), small_layout());
        let two = BucketStorage::new(dir.path(), small_layout());
        let r = BufferRef::new(2, 3).unwrap();

        one.region(r).unwrap().header().init_fresh(InstanceId::new(5));
        let seen = two.region(r).unwrap().header().load();
        assert_eq!(seen.owner, InstanceId::new(5));
    }

    #[test]
    fn pow2_payload_is_page_aligned() {
        let dir = tempdir().unwrap();
        let layout = small_layout();
        let storage = BucketStorage::new(dir.path(), layout.clone());
        for bucket in 2..=3u8 {
            for index in 1..=3 {
                let region = storage.region(BufferRef::new(bucket, index).unwrap()).unwrap();
                assert_eq!(region.data_ptr() as usize % 4096, 0);
                assert_eq!(region.data_len() as u64, layout.base_size(bucket));
            }
        }
    }

    #[test]
    fn header_immediately_precedes_payload() {
        let dir = tempdir().unwrap();
        let storage = BucketStorage::new(dir.path(), small_layout());
        for bucket in 0..=3u8 {
            let region = storage.region(BufferRef::new(bucket, 2).unwrap()).unwrap();
            let header = region.header() as *const BufferHeader as usize;
            assert_eq!(header + 8, region.data_ptr() as usize);
        }
    }

    #[test]
    fn pow2_payload_end_does_not_touch_next_header() {
        let dir = tempdir().unwrap();
        let storage = BucketStorage::new(dir.path(), small_layout());
        let a = storage.region(BufferRef::new(2, 1).unwrap()).unwrap();
        let b = storage.region(BufferRef::new(2, 2).unwrap()).unwrap();

        b.header().init_fresh(InstanceId::new(3));
        unsafe { a.data_mut().fill(0xFF) };
        assert!(b.header().load().is(BufferState::ReleasingDisposed));
        assert_eq!(b.header().load().owner, InstanceId::new(3));
    }

    #[test]
    fn checked_access_rejects_out_of_layout_refs() {
        let dir = tempdir().unwrap();
        let storage = BucketStorage::new(dir.path(), small_layout());
        let err = storage.region(BufferRef::new(4, 1).unwrap()).unwrap_err();
        assert_eq!(err.code(), "E001");
        let err = storage.region(BufferRef::from_raw(1 << 27)).unwrap_err();
        assert_eq!(err.code(), "E002");
    }
}
