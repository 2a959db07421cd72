//! Version command - show version and on-disk format information.

use anyhow::Result;
use shmbuf_core::bucket::BucketLayout;
use shmbuf_core::config::{ENV_DIR, ENV_INSTANCE_ID, ENV_MAX_BYTES};
use shmbuf_core::header::HEADER_SIZE;
use std::fmt::Write;

/// Version information.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the version command.
pub fn run() -> Result<()> {
    print!("{}", render(&BucketLayout::default())?);
    Ok(())
}

/// Version banner plus the bucket geometry a default store uses.
fn render(layout: &BucketLayout) -> Result<String> {
    let mut out = String::new();
    writeln!(out, "shmbuf {VERSION} ({} / {})", std::env::consts::OS, std::env::consts::ARCH)?;
    writeln!(out)?;
    writeln!(out, "Header:      {HEADER_SIZE} bytes")?;
    writeln!(out, "Page size:   {} bytes", layout.page_size())?;
    writeln!(out, "Buckets:     0..={}", layout.max_bucket_index())?;
    writeln!(out)?;
    writeln!(out, "{:<8} {:>12} {:>12} {:>6}", "BUCKET", "SLOT", "PAYLOAD", "POW2")?;
    for bucket in 0..=layout.max_bucket_index() {
        writeln!(
            out,
            "{:<8} {:>12} {:>12} {:>6}",
            bucket,
            layout.slot_len(bucket),
            layout.payload_len(bucket),
            if layout.is_pow2(bucket) { "yes" } else { "no" }
        )?;
    }
    writeln!(out)?;
    writeln!(out, "Environment: {ENV_DIR}, {ENV_MAX_BYTES}, {ENV_INSTANCE_ID}")?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_every_default_bucket() {
        let text = render(&BucketLayout::default()).unwrap();
        assert!(text.starts_with(&format!("shmbuf {VERSION}")));
        assert!(text.contains("Header:      8 bytes"));
        // Bucket 2 is the first pow2 bucket: 12288-byte slot, 8192 payload.
        let row = text.lines().find(|l| l.starts_with("2 ")).unwrap();
        let cols: Vec<_> = row.split_whitespace().collect();
        assert_eq!(cols, ["2", "12288", "8192", "yes"]);
        assert!(text.lines().any(|l| l.starts_with("15 ")));
        assert!(text.contains("SHMBUF_INSTANCE_ID"));
    }
}
