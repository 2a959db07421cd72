//! A single memory-mapped bucket file.

use super::layout::DISK_SPACE_MARGIN;
use crate::error::{Result, StoreError};
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

/// A sparse file of fixed-size slots, mapped shared into this process.
///
/// Every process attached to the store maps the same file, so writes through
/// the mapping are visible to all of them.
pub struct BucketFile {
    path: PathBuf,
    base: NonNull<u8>,
    len: usize,
    // Keeps the mapping behind `base` alive.
    _mmap: MmapMut,
}

// SAFETY: `base` points into `_mmap`, which lives as long as the BucketFile.
// Concurrent access to slot contents is governed by the header protocol.
unsafe impl Send for BucketFile {}
// SAFETY: see above.
unsafe impl Sync for BucketFile {}

impl BucketFile {
    /// Open a bucket file, creating and sizing it if it does not exist.
    ///
    /// A new file requires `DISK_SPACE_MARGIN` times its length in free
    /// space on the target filesystem.
    pub fn open_or_create(path: &Path, len: u64) -> Result<Self> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent).map_err(|e| StoreError::BucketFile {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

        let is_new = !path.exists();
        if is_new {
            let available = fs2::available_space(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                cause: e.to_string(),
            })?;
            let required = len.saturating_mul(DISK_SPACE_MARGIN);
            if available < required {
                return Err(StoreError::DiskSpace {
                    path: path.to_path_buf(),
                    required,
                    available,
                });
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::BucketFile {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?;

        let current = file
            .metadata()
            .map_err(|e| StoreError::BucketFile {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?
            .len();
        // Another process may have created it first; never shrink.
        if current < len {
            file.set_len(len).map_err(|e| StoreError::BucketFile {
                path: path.to_path_buf(),
                cause: e.to_string(),
            })?;
        }

        let mut mmap = unsafe {
            MmapOptions::new()
                .len(len as usize)
                .map_mut(&file)
                .map_err(|e| StoreError::BucketMmap {
                    path: path.to_path_buf(),
                    cause: e.to_string(),
                })?
        };

        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| StoreError::BucketMmap {
            path: path.to_path_buf(),
            cause: "mapping returned a null pointer".to_string(),
        })?;

        if is_new {
            tracing::info!(path = %path.display(), len, "Created bucket file");
        } else {
            tracing::debug!(path = %path.display(), len, "Opened bucket file");
        }

        Ok(Self {
            path: path.to_path_buf(),
            base,
            len: len as usize,
            _mmap: mmap,
        })
    }

    /// Path of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mapped length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to `offset` within the mapping.
    ///
    /// # Safety
    /// `offset` must be less than [`BucketFile::len`].
    pub(crate) unsafe fn ptr_at(&self, offset: usize) -> *mut u8 {
        debug_assert!(offset < self.len);
        // SAFETY: caller guarantees the offset is in bounds.
        unsafe { self.base.as_ptr().add(offset) }
    }
}

impl std::fmt::Debug for BucketFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_sparse_file_of_requested_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("buckets").join("0").join("0");
        let file = BucketFile::open_or_create(&path, 8192).unwrap();
        assert_eq!(file.len(), 8192);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8192);
    }

    #[test]
    fn reopen_shares_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0");
        let a = BucketFile::open_or_create(&path, 4096).unwrap();
        let b = BucketFile::open_or_create(&path, 4096).unwrap();
        unsafe {
            *a.ptr_at(100) = 0xAB;
            assert_eq!(*b.ptr_at(100), 0xAB);
        }
    }

    #[test]
    fn refuses_file_larger_than_free_space() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge");
        let err = BucketFile::open_or_create(&path, u64::MAX / 4).unwrap_err();
        assert!(err.is_capacity_error());
        assert!(!path.exists());
    }
}
