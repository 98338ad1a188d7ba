//! Download progress aggregation
//!
//! Pure functions of the pack index, per-file readiness and the set of
//! queued packs. Sizes are uncompressed file sizes, so a pack's total is
//! its [`PackIndex::pack_size`] and shared dependencies count once.

use super::index::PackIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub total: u64,
    pub already_downloaded: u64,
    pub in_queue: u64,
    pub is_requesting_enabled: bool,
}

/// Progress over the whole catalog.
///
/// `in_queue` counts the missing bytes of every queued pack's closure.
pub fn overall(index: &PackIndex, ready: &[bool], queued: &[u32], requesting_enabled: bool) -> Progress {
    let already_downloaded = index
        .files()
        .iter()
        .zip(ready)
        .filter(|(_, &r)| r)
        .map(|(f, _)| f.original_size as u64)
        .sum();

    let in_queue = index
        .graph()
        .closure_indices(queued)
        .into_iter()
        .map(|pack| missing_bytes(index, ready, pack))
        .sum();

    Progress {
        total: index.catalog_size(),
        already_downloaded,
        in_queue,
        is_requesting_enabled: requesting_enabled,
    }
}

/// Progress over the closure of exactly `packs`.
pub fn for_packs(
    index: &PackIndex,
    ready: &[bool],
    queued: &[u32],
    packs: &[u32],
    requesting_enabled: bool,
) -> Progress {
    let queued_closure = index.graph().closure_indices(queued);
    let mut progress = Progress {
        is_requesting_enabled: requesting_enabled,
        ..Progress::default()
    };

    for pack in index.graph().closure_indices(packs) {
        let total = index.pack_size(pack);
        let missing = missing_bytes(index, ready, pack);
        progress.total += total;
        progress.already_downloaded += total - missing;
        if queued_closure.contains(&pack) {
            progress.in_queue += missing;
        }
    }
    progress
}

fn missing_bytes(index: &PackIndex, ready: &[bool], pack: u32) -> u64 {
    index
        .files_of(pack)
        .iter()
        .filter(|&&f| !ready.get(f).copied().unwrap_or(false))
        .map(|&f| index.file(f).original_size as u64)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CompressionType, FileInfo};
    use crate::meta::{PackDescription, PackMetaData};

    fn file(name: &str, size: u32) -> FileInfo {
        FileInfo {
            relative_file_path: name.to_string(),
            compression_type: CompressionType::None,
            compressed_size: size,
            original_size: size,
            offset: 0,
            compressed_crc32: 0,
        }
    }

    fn pack(name: &str, deps: &[u32]) -> PackDescription {
        PackDescription {
            name: name.to_string(),
            dependencies: deps.to_vec(),
        }
    }

    /// 0 <- 1 <- 2, 0 <- 3, plus the unrelated pack 4
    fn index() -> PackIndex {
        let packs = vec![pack("0", &[]), pack("1", &[0]), pack("2", &[1]), pack("3", &[0]), pack("4", &[])];
        let files = vec![file("a", 100), file("b", 10), file("c", 20), file("d", 5), file("e", 1000)];
        let meta = PackMetaData::new(packs, vec![0, 1, 2, 3, 4]);
        PackIndex::build(files, &meta, None).unwrap()
    }

    #[test]
    fn test_shared_dependencies_count_once() {
        let index = index();
        let ready = vec![false; 5];

        let two = for_packs(&index, &ready, &[], &[2], true);
        let three = for_packs(&index, &ready, &[], &[3], true);
        let both = for_packs(&index, &ready, &[], &[2, 3], true);
        assert_eq!(two.total, 130);
        assert_eq!(three.total, 105);
        assert_eq!(both.total, 135);
        assert!(both.total < two.total + three.total);
    }

    #[test]
    fn test_overall_covers_catalog() {
        let index = index();
        let ready = vec![true, true, false, false, false];

        let all = overall(&index, &ready, &[2], false);
        assert_eq!(all.total, 1135);
        assert_eq!(all.already_downloaded, 110);
        assert_eq!(all.in_queue, 20);
        assert!(!all.is_requesting_enabled);

        let packs = for_packs(&index, &ready, &[2], &[2], false);
        assert!(packs.total < all.total);
        assert_eq!(packs.already_downloaded, 110);
        assert_eq!(packs.in_queue, 20);

        let ready = vec![true, true, true, false, false];
        let done = for_packs(&index, &ready, &[2], &[2], true);
        assert_eq!(done.total, done.already_downloaded);
        assert_eq!(done.in_queue, 0);
    }
}
