//! CLI command implementations.

pub mod dump;
pub mod repair;
pub mod stats;
pub mod version;

use anyhow::{Context, Result};
use shmbuf_core::{BufferStore, StoreConfig};
use std::path::PathBuf;

/// Where a command finds its store.
#[derive(Debug, Default)]
pub struct StoreSource {
    /// Explicit store directory.
    pub dir: Option<PathBuf>,
    /// YAML configuration file.
    pub config: Option<PathBuf>,
}

impl StoreSource {
    /// Resolve the configuration: file (or environment), then `--dir`.
    pub fn config(&self) -> Result<StoreConfig> {
        let config = match &self.config {
            Some(path) => StoreConfig::from_yaml_file(path)
                .with_context(|| format!("Failed to load config: {}", path.display()))?,
            None => StoreConfig::from_env_or_default(),
        };
        Ok(match &self.dir {
            Some(dir) => config.with_directory(dir),
            None => config,
        })
    }

    /// Open the store, refusing to create one that does not exist yet.
    pub fn open(&self) -> Result<BufferStore> {
        let config = self.config()?;
        if !config.table_dir().exists() {
            anyhow::bail!("No store found at {}", config.directory.display());
        }
        let directory = config.directory.clone();
        BufferStore::open(config)
            .with_context(|| format!("Failed to open store: {}", directory.display()))
    }
}
