//! Dump command - print both allocation tables.

use super::StoreSource;
use anyhow::{Context, Result};

/// Run the dump command.
pub fn run(source: &StoreSource) -> Result<()> {
    let store = source.open()?;
    let dump = store.dump().context("Failed to read allocation table")?;
    println!("Store: {}", store.config().directory.display());
    println!();
    print!("{dump}");
    Ok(())
}
