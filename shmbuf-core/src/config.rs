//! Store configuration.
//!
//! Every field has a serde default, so a YAML document only needs the keys
//! it changes:
//!
//! ```yaml
//! directory: /var/lib/shmbuf
//! allocator:
//!   max_total_bytes: 8589934592
//! pool:
//!   cache_per_bucket: 32
//! ```

use crate::allocator::DEFAULT_TABLE_MAP_SIZE;
use crate::bucket::{BucketLayout, DEFAULT_FILE_SLOTS, DEFAULT_MIN_BUCKET_SIZE, DEFAULT_PAGE_SIZE};
use crate::error::{Result, StoreError};
use crate::types::{InstanceId, MAX_BUCKET_INDEX};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the store directory.
pub const ENV_DIR: &str = "SHMBUF_DIR";
/// Environment variable overriding the allocation budget.
pub const ENV_MAX_BYTES: &str = "SHMBUF_MAX_BYTES";
/// Environment variable overriding the instance id.
pub const ENV_INSTANCE_ID: &str = "SHMBUF_INSTANCE_ID";

/// Top-level configuration of a buffer store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store directory; holds `table/` and `buckets/`.
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Instance id stamped into buffer headers. Defaults to the process id.
    #[serde(default)]
    pub instance_id: Option<u32>,

    /// Bucket geometry. Must match across every process sharing the store.
    #[serde(default)]
    pub layout: LayoutConfig,

    /// Allocator settings.
    #[serde(default)]
    pub allocator: AllocatorConfig,

    /// Per-process pool settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Packer settings.
    #[serde(default)]
    pub packer: PackerConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            instance_id: None,
            layout: LayoutConfig::default(),
            allocator: AllocatorConfig::default(),
            pool: PoolConfig::default(),
            packer: PackerConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration for testing.
    ///
    /// Uses a temporary directory with a unique name per invocation and small
    /// bucket files.
    pub fn in_memory() -> Self {
        Self {
            directory: std::env::temp_dir().join(format!("shmbuf_{}", uuid::Uuid::new_v4())),
            instance_id: None,
            layout: LayoutConfig {
                file_slots: 64,
                ..LayoutConfig::default()
            },
            allocator: AllocatorConfig {
                max_total_bytes: 256 * 1024 * 1024,
                sync_new_buffers: false,
                table_map_size: 64 * 1024 * 1024,
                ..AllocatorConfig::default()
            },
            pool: PoolConfig::default(),
            packer: PackerConfig::default(),
        }
    }

    /// Set the store directory.
    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = directory.into();
        self
    }

    /// Set the instance id.
    pub fn with_instance_id(mut self, id: u32) -> Self {
        self.instance_id = Some(id);
        self
    }

    /// Set the allocation budget in bytes.
    pub fn with_max_total_bytes(mut self, bytes: u64) -> Self {
        self.allocator.max_total_bytes = bytes;
        self
    }

    /// Set the capacity check cadence.
    pub fn with_capacity_check_interval(mut self, interval: u64) -> Self {
        self.allocator.capacity_check_interval = interval;
        self
    }

    /// Set the number of cached buffers per bucket.
    pub fn with_cache_per_bucket(mut self, count: usize) -> Self {
        self.pool.cache_per_bucket = count;
        self
    }

    /// Set the bucket layout.
    pub fn with_layout(mut self, layout: LayoutConfig) -> Self {
        self.layout = layout;
        self
    }

    /// Instance id to stamp into headers.
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance_id
            .map(InstanceId::new)
            .unwrap_or_else(InstanceId::current)
    }

    /// Directory of the allocation table environment.
    #[must_use]
    pub fn table_dir(&self) -> PathBuf {
        self.directory.join("table")
    }

    /// Root of the bucket file tree.
    #[must_use]
    pub fn buckets_dir(&self) -> PathBuf {
        self.directory.join("buckets")
    }

    /// Check every section for impossible values.
    pub fn validate(&self) -> Result<()> {
        self.layout.to_layout()?;
        self.allocator.validate()?;
        self.pool.validate()?;
        self.packer.validate()?;
        Ok(())
    }

    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::parse_yaml(yaml, Path::new("<inline>"))
    }

    /// Load a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| StoreError::Io {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;
        Self::parse_yaml(&text, path)
    }

    fn parse_yaml(yaml: &str, source: &Path) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| StoreError::YamlParse {
            path: source.to_path_buf(),
            cause: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides to the default configuration.
    ///
    /// # Environment Variables
    ///
    /// - `SHMBUF_DIR`: store directory
    /// - `SHMBUF_MAX_BYTES`: allocation budget in bytes
    /// - `SHMBUF_INSTANCE_ID`: instance id stamped into headers
    ///
    /// Unparseable numbers are ignored with a warning.
    pub fn from_env_or_default() -> Self {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = lookup(ENV_DIR) {
            self.directory = PathBuf::from(dir);
        }
        if let Some(value) = lookup(ENV_MAX_BYTES) {
            match value.parse() {
                Ok(bytes) => self.allocator.max_total_bytes = bytes,
                Err(_) => tracing::warn!(%value, var = ENV_MAX_BYTES, "Ignoring unparseable override"),
            }
        }
        if let Some(value) = lookup(ENV_INSTANCE_ID) {
            match value.parse() {
                Ok(id) => self.instance_id = Some(id),
                Err(_) => tracing::warn!(%value, var = ENV_INSTANCE_ID, "Ignoring unparseable override"),
            }
        }
        self
    }
}

fn default_directory() -> PathBuf {
    PathBuf::from("/tmp/shmbuf")
}

fn config_err(field: &str, cause: impl Into<String>) -> StoreError {
    StoreError::ConfigValue {
        field: field.to_string(),
        cause: cause.into(),
    }
}

/// Bucket geometry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutConfig {
    /// Page size; pow2 buckets add one page per slot.
    #[serde(default = "default_page_size")]
    pub page_size: u64,

    /// Slot size of bucket 0.
    #[serde(default = "default_min_bucket_size")]
    pub min_bucket_size: u64,

    /// Bucket size at which pow2 layout starts.
    #[serde(default = "default_pow2_threshold")]
    pub pow2_threshold: u64,

    /// Highest bucket index used.
    #[serde(default = "default_max_bucket_index")]
    pub max_bucket_index: u8,

    /// Bucket-0 slots per file.
    #[serde(default = "default_file_slots")]
    pub file_slots: u64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            min_bucket_size: default_min_bucket_size(),
            pow2_threshold: default_pow2_threshold(),
            max_bucket_index: default_max_bucket_index(),
            file_slots: default_file_slots(),
        }
    }
}

impl LayoutConfig {
    /// Build the validated layout.
    pub fn to_layout(&self) -> Result<BucketLayout> {
        BucketLayout::new(
            self.page_size,
            self.min_bucket_size,
            self.pow2_threshold,
            self.max_bucket_index,
            self.file_slots,
        )
    }
}

fn default_page_size() -> u64 {
    DEFAULT_PAGE_SIZE
}

fn default_min_bucket_size() -> u64 {
    DEFAULT_MIN_BUCKET_SIZE
}

fn default_pow2_threshold() -> u64 {
    2 * DEFAULT_PAGE_SIZE
}

fn default_max_bucket_index() -> u8 {
    MAX_BUCKET_INDEX
}

fn default_file_slots() -> u64 {
    DEFAULT_FILE_SLOTS
}

/// Allocator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Total bytes all allocated buffers may occupy.
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,

    /// Recompute the allocated total every this many allocations.
    #[serde(default = "default_capacity_check_interval")]
    pub capacity_check_interval: u64,

    /// Force the table to disk after allocating a new buffer.
    #[serde(default = "default_true")]
    pub sync_new_buffers: bool,

    /// Map size of the table environment.
    #[serde(default = "default_table_map_size")]
    pub table_map_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: default_max_total_bytes(),
            capacity_check_interval: default_capacity_check_interval(),
            sync_new_buffers: true,
            table_map_size: default_table_map_size(),
        }
    }
}

impl AllocatorConfig {
    fn validate(&self) -> Result<()> {
        if self.max_total_bytes == 0 {
            return Err(config_err("allocator.max_total_bytes", "must be non-zero"));
        }
        if self.capacity_check_interval == 0 {
            return Err(config_err(
                "allocator.capacity_check_interval",
                "must be non-zero",
            ));
        }
        if self.table_map_size == 0 {
            return Err(config_err("allocator.table_map_size", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_max_total_bytes() -> u64 {
    64 * 1024 * 1024 * 1024
}

fn default_capacity_check_interval() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_table_map_size() -> usize {
    DEFAULT_TABLE_MAP_SIZE
}

/// Per-process pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Buffers kept per bucket for reuse without a transaction.
    #[serde(default = "default_cache_per_bucket")]
    pub cache_per_bucket: usize,

    /// Empty handles kept for reuse.
    #[serde(default = "default_handle_arena_capacity")]
    pub handle_arena_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            cache_per_bucket: default_cache_per_bucket(),
            handle_arena_capacity: default_handle_arena_capacity(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.cache_per_bucket == 0 {
            return Err(config_err("pool.cache_per_bucket", "must be non-zero"));
        }
        if self.handle_arena_capacity == 0 {
            return Err(config_err("pool.handle_arena_capacity", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_cache_per_bucket() -> usize {
    16
}

fn default_handle_arena_capacity() -> usize {
    256
}

/// Packer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackerConfig {
    /// Worker threads of the packer runtime.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pause between passes over pending streams.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Lifetime of a per-stream packer lease.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,

    /// Blocks processed per stream before the lease is handed back.
    #[serde(default = "default_max_blocks_per_lease")]
    pub max_blocks_per_lease: usize,
}

impl Default for PackerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            interval_ms: default_interval_ms(),
            lease_ms: default_lease_ms(),
            max_blocks_per_lease: default_max_blocks_per_lease(),
        }
    }
}

impl PackerConfig {
    /// Pause between passes.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Lease lifetime.
    #[must_use]
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(config_err("packer.workers", "must be non-zero"));
        }
        if self.lease_ms == 0 {
            return Err(config_err("packer.lease_ms", "must be non-zero"));
        }
        if self.max_blocks_per_lease == 0 {
            return Err(config_err("packer.max_blocks_per_lease", "must be non-zero"));
        }
        Ok(())
    }
}

fn default_workers() -> usize {
    2
}

fn default_interval_ms() -> u64 {
    100
}

fn default_lease_ms() -> u64 {
    30_000
}

fn default_max_blocks_per_lease() -> usize {
    64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_values() {
        let config = StoreConfig::default();
        assert_eq!(config.layout.page_size, 4096);
        assert_eq!(config.layout.min_bucket_size, 2048);
        assert_eq!(config.layout.pow2_threshold, 8192);
        assert_eq!(config.allocator.capacity_check_interval, 100);
        assert!(config.allocator.sync_new_buffers);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = StoreConfig::from_yaml_str(
            "directory: /data/store\nallocator:\n  capacity_check_interval: 10\npool:\n  cache_per_bucket: 4\n",
        )
        .unwrap();
        assert_eq!(config.directory, PathBuf::from("/data/store"));
        assert_eq!(config.allocator.capacity_check_interval, 10);
        assert_eq!(config.allocator.max_total_bytes, default_max_total_bytes());
        assert_eq!(config.pool.cache_per_bucket, 4);
        assert_eq!(config.layout, LayoutConfig::default());
    }

    #[test]
    fn yaml_values_are_validated() {
        let err = StoreConfig::from_yaml_str("layout:\n  max_bucket_index: 16\n").unwrap_err();
        assert_eq!(err.code(), "E802");
        let err = StoreConfig::from_yaml_str("allocator: [1, 2]").unwrap_err();
        assert_eq!(err.code(), "E801");
    }

    #[test]
    fn yaml_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");
        let config = StoreConfig::in_memory().with_instance_id(3);
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();
        assert_eq!(StoreConfig::from_yaml_file(&path).unwrap(), config);
    }

    #[test]
    fn env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_DIR, "/srv/buffers"),
            (ENV_MAX_BYTES, "1048576"),
            (ENV_INSTANCE_ID, "not-a-number"),
        ]
        .into_iter()
        .collect();
        let config =
            StoreConfig::default().with_env_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.directory, PathBuf::from("/srv/buffers"));
        assert_eq!(config.allocator.max_total_bytes, 1_048_576);
        assert_eq!(config.instance_id, None);
    }

    #[test]
    fn builder_pattern() {
        let config = StoreConfig::in_memory()
            .with_directory("/x")
            .with_instance_id(5)
            .with_max_total_bytes(4096)
            .with_capacity_check_interval(10)
            .with_cache_per_bucket(2);
        assert_eq!(config.instance(), InstanceId::new(5));
        assert_eq!(config.table_dir(), PathBuf::from("/x/table"));
        assert_eq!(config.buckets_dir(), PathBuf::from("/x/buckets"));
        assert_eq!(config.allocator.max_total_bytes, 4096);
        assert_eq!(config.pool.cache_per_bucket, 2);
    }

    #[test]
    fn rejects_zero_cache() {
        let config = StoreConfig::in_memory().with_cache_per_bucket(0);
        assert_eq!(config.validate().unwrap_err().code(), "E802");
    }
}
