//! Local pack store
//!
//! Every file of the catalog lives in the download directory as
//! `<relative path>.dvpl`: the bytes exactly as stored in the superpack
//! followed by a lite footer. Downloads go to `<relative path>.dvpl.part`
//! and are committed once their CRC matches the file table.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::archive::lite::{self, LiteFooter};
use crate::archive::FileInfo;
use crate::hash::compute_file_crc32_prefix;
use crate::paths::{ensure_parent_dirs, part_path, store_path};

/// Verify a downloaded `.part` and turn it into a store file.
///
/// Returns `Ok(false)` (and deletes the part) when its size or CRC is
/// wrong so the file can be fetched again.
pub fn commit_part(store_dir: &Path, file: &FileInfo) -> Result<bool> {
    let part = part_path(store_dir, &file.relative_file_path);
    let target = store_path(store_dir, &file.relative_file_path);

    // Empty entries finish without the downloader ever touching the disk
    if file.compressed_size == 0 && !part.exists() {
        ensure_parent_dirs(&part)
            .with_context(|| format!("Failed to create directory for {}", part.display()))?;
        fs::File::create(&part).with_context(|| format!("Failed to create {}", part.display()))?;
    }

    let len = fs::metadata(&part)
        .with_context(|| format!("Downloaded file missing: {}", part.display()))?
        .len();
    if len != file.compressed_size as u64 {
        warn!(
            "Size mismatch for {}: expected {}, got {}",
            file.relative_file_path, file.compressed_size, len
        );
        discard(&part);
        return Ok(false);
    }

    let (crc, _) = compute_file_crc32_prefix(&part, len)?;
    if crc != file.compressed_crc32 {
        warn!(
            "CRC mismatch for {}: expected {:08x}, got {:08x}",
            file.relative_file_path, file.compressed_crc32, crc
        );
        discard(&part);
        return Ok(false);
    }

    let footer = LiteFooter::new(
        file.original_size,
        file.compressed_size,
        file.compressed_crc32,
        file.compression_type,
    );
    lite::append_footer(&part, &footer)
        .with_context(|| format!("Failed to finish {}", part.display()))?;
    fs::rename(&part, &target).with_context(|| {
        format!("Failed to rename {} to {}", part.display(), target.display())
    })?;

    debug!("Stored {}", target.display());
    Ok(true)
}

/// Remove the store and part files of one entry. Returns whether anything was deleted.
pub fn remove_file(store_dir: &Path, relative_path: &str) -> bool {
    let mut removed = false;
    for path in [store_path(store_dir, relative_path), part_path(store_dir, relative_path)] {
        match fs::remove_file(&path) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
        }
    }
    removed
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!("Failed to delete {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{codec, CompressionType};
    use crate::hash::crc32;
    use tempfile::TempDir;

    fn entry(name: &str, data: &[u8]) -> (FileInfo, Vec<u8>) {
        let stored = codec::compress(CompressionType::Lz4Hc, data).unwrap();
        (
            FileInfo {
                relative_file_path: name.to_string(),
                compression_type: CompressionType::Lz4Hc,
                compressed_size: stored.len() as u32,
                original_size: data.len() as u32,
                offset: 0,
                compressed_crc32: crc32(&stored),
            },
            stored,
        )
    }

    #[test]
    fn test_commit_good_part() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let data = b"sound/engine.ogg contents".repeat(20);
        let (info, stored) = entry("sound/engine.ogg", &data);

        let part = part_path(dir.path(), &info.relative_file_path);
        ensure_parent_dirs(&part)?;
        fs::write(&part, &stored)?;

        assert!(commit_part(dir.path(), &info)?);
        assert!(!part.exists());
        let target = store_path(dir.path(), &info.relative_file_path);
        assert_eq!(lite::load(&target)?, data);
        assert_eq!(lite::read_footer(&target)?.compressed_crc32, info.compressed_crc32);
        Ok(())
    }

    #[test]
    fn test_corrupt_part_is_discarded() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (info, mut stored) = entry("a.txt", b"hello hello hello");
        stored[0] ^= 0xFF;

        let part = part_path(dir.path(), "a.txt");
        fs::write(&part, &stored)?;
        assert!(!commit_part(dir.path(), &info)?);
        assert!(!part.exists());
        assert!(!store_path(dir.path(), "a.txt").exists());

        fs::write(&part, &stored[..2])?;
        assert!(!commit_part(dir.path(), &info)?);
        Ok(())
    }

    #[test]
    fn test_empty_entry() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let info = FileInfo {
            relative_file_path: "empty/none.bin".into(),
            compression_type: CompressionType::None,
            compressed_size: 0,
            original_size: 0,
            offset: 0,
            compressed_crc32: 0,
        };
        assert!(commit_part(dir.path(), &info)?);
        assert_eq!(lite::load(&store_path(dir.path(), "empty/none.bin"))?, Vec::<u8>::new());

        assert!(remove_file(dir.path(), "empty/none.bin"));
        assert!(!remove_file(dir.path(), "empty/none.bin"));
        Ok(())
    }
}
