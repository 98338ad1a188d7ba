//! Local pack store scan
//!
//! Run once per index load. Store files matching the index are marked
//! ready; anything the index doesn't know, or whose footer disagrees with
//! the file table, is deleted. Partial downloads of known files are kept
//! for resuming.

use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::index::PackIndex;
use crate::archive::lite;
use crate::paths::{PART_EXT, STORE_EXT};

#[derive(Debug, Default)]
pub struct ScanResult {
    /// Readiness per file index.
    pub ready: Vec<bool>,
    pub deleted: usize,
    pub partial: usize,
}

enum Verdict {
    Ready(usize),
    Partial,
    Delete(&'static str),
    Ignore,
}

pub fn scan_store(store_dir: &Path, index: &PackIndex) -> ScanResult {
    let candidates: Vec<PathBuf> = WalkDir::new(store_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();

    let verdicts: Vec<(PathBuf, Verdict)> = candidates
        .into_par_iter()
        .map(|path| {
            let verdict = judge(store_dir, &path, index);
            (path, verdict)
        })
        .collect();

    let mut result = ScanResult {
        ready: vec![false; index.files().len()],
        ..ScanResult::default()
    };

    for (path, verdict) in verdicts {
        match verdict {
            Verdict::Ready(file) => result.ready[file] = true,
            Verdict::Partial => result.partial += 1,
            Verdict::Delete(reason) => {
                debug!("Deleting {} ({})", path.display(), reason);
                match fs::remove_file(&path) {
                    Ok(()) => result.deleted += 1,
                    Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
                }
            }
            Verdict::Ignore => {}
        }
    }

    info!(
        "Scanned {}: {} ready, {} partial, {} deleted",
        store_dir.display(),
        result.ready.iter().filter(|&&r| r).count(),
        result.partial,
        result.deleted
    );
    result
}

fn judge(store_dir: &Path, path: &Path, index: &PackIndex) -> Verdict {
    let Ok(relative) = path.strip_prefix(store_dir) else {
        return Verdict::Ignore;
    };
    let relative = relative.to_string_lossy().replace('\\', "/");

    if let Some(name) = relative.strip_suffix(PART_EXT) {
        return match index.file_index(name) {
            Some(_) => Verdict::Partial,
            None => Verdict::Delete("partial download of an unknown file"),
        };
    }

    let Some(name) = relative.strip_suffix(STORE_EXT) else {
        return Verdict::Ignore;
    };
    let Some(file) = index.file_index(name) else {
        return Verdict::Delete("not in the index");
    };

    let expected = index.file(file);
    match lite::read_footer(path) {
        Ok(footer)
            if footer.compressed_crc32 == expected.compressed_crc32
                && footer.compressed_size == expected.compressed_size
                && footer.original_size == expected.original_size
                && footer.compression() == expected.compression_type =>
        {
            Verdict::Ready(file)
        }
        Ok(_) => Verdict::Delete("footer differs from the file table"),
        Err(_) => Verdict::Delete("no valid footer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CompressionType, FileInfo};
    use crate::dlc::store;
    use crate::hash::crc32;
    use crate::meta::{PackDescription, PackMetaData};
    use crate::paths::{ensure_parent_dirs, part_path, store_path};
    use tempfile::TempDir;

    fn index(files: &[(&str, &[u8])]) -> PackIndex {
        let infos = files
            .iter()
            .map(|(name, data)| FileInfo {
                relative_file_path: name.to_string(),
                compression_type: CompressionType::None,
                compressed_size: data.len() as u32,
                original_size: data.len() as u32,
                offset: 0,
                compressed_crc32: crc32(data),
            })
            .collect();
        let meta = PackMetaData::new(
            vec![PackDescription {
                name: "all".into(),
                dependencies: vec![],
            }],
            vec![0; files.len()],
        );
        PackIndex::build(infos, &meta, None).unwrap()
    }

    #[test]
    fn test_scan_keeps_valid_and_deletes_junk() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let root = dir.path();
        let index = index(&[("ui/a.png", b"aaaa"), ("ui/b.png", b"bbbbbb"), ("c.txt", b"cc")]);

        // Valid store file
        ensure_parent_dirs(&store_path(root, "ui/a.png"))?;
        lite::write(&store_path(root, "ui/a.png"), b"aaaa", CompressionType::None)?;
        // Stale: right name, different content
        lite::write(&store_path(root, "ui/b.png"), b"zzzzzz", CompressionType::None)?;
        // Resumable part
        let part = part_path(root, "c.txt");
        fs::write(&part, b"c")?;
        // Junk
        let junk = store_path(root, "old/removed.txt");
        ensure_parent_dirs(&junk)?;
        fs::write(&junk, b"garbage")?;
        let orphan_part = part_path(root, "old/gone.txt");
        fs::write(&orphan_part, b"g")?;
        // Not ours
        fs::write(root.join("local_copy_server_meta.meta"), b"meta")?;

        let result = scan_store(root, &index);
        assert_eq!(result.ready, vec![true, false, false]);
        assert_eq!(result.partial, 1);
        assert_eq!(result.deleted, 3);

        assert!(store_path(root, "ui/a.png").exists());
        assert!(!store_path(root, "ui/b.png").exists());
        assert!(part.exists());
        assert!(!junk.exists());
        assert!(!orphan_part.exists());
        assert!(root.join("local_copy_server_meta.meta").exists());

        // A committed part is picked up by the next scan
        fs::write(&part, b"cc")?;
        assert!(store::commit_part(root, index.file(2))?);
        assert_eq!(scan_store(root, &index).ready, vec![true, false, true]);
        Ok(())
    }
}
