//! Remote index acquisition
//!
//! The index is read from the tail of the superpack with three range
//! requests (footer, files table, meta block), each validated against the
//! footer's CRCs. A copy of the three blocks is kept in the download
//! directory; when the remote footer is unchanged the copy is used instead
//! of downloading the table and meta again, and it serves as the offline
//! fallback when the server stays unreachable.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::InitState;
use crate::archive::pack::{FileTable, PackFooter, FOOTER_SIZE};
use crate::archive::ArchiveError;
use crate::downloader::{Destination, MemoryBuffer, Range, RangeDownloader, Task, TaskState, TaskStatus};
use crate::hash::crc32;
use crate::meta::db::write_packs_db;
use crate::meta::{MetaError, PackMetaData};

pub const CACHE_FOOTER: &str = "local_copy_server_footer.footer";
pub const CACHE_FILE_TABLE: &str = "local_copy_server_file_table.block";
pub const CACHE_META: &str = "local_copy_server_meta.meta";
pub const CACHE_PACKS_DB: &str = "local_copy_server_packs.db";

/// How often a blocked fetch checks for shutdown.
const POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error("Network error: {0}")]
    Network(String),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error("Stopped")]
    Stopped,
}

/// Everything read from the superpack tail.
#[derive(Debug)]
pub struct RemoteIndex {
    pub footer: PackFooter,
    pub table: FileTable,
    pub meta: PackMetaData,
}

/// Blocking range fetches that give up when `stop` is raised.
pub struct Fetcher<'a> {
    pub downloader: &'a RangeDownloader,
    pub url: &'a str,
    pub stop: &'a AtomicBool,
}

impl Fetcher<'_> {
    pub fn content_size(&self) -> Result<u64, InitError> {
        let task = self.downloader.start_get_content_size(self.url);
        Ok(self.wait(task)?.size_total)
    }

    pub fn range(&self, offset: u64, size: u64) -> Result<Vec<u8>, InitError> {
        let buffer = MemoryBuffer::new(size as usize);
        let task = self.downloader.start_task(
            self.url,
            Destination::Memory(buffer.clone()),
            Range::new(offset, size),
        );
        self.wait(task)?;
        Ok(buffer.committed())
    }

    fn wait(&self, task: Task) -> Result<TaskStatus, InitError> {
        while !self.downloader.wait_task_timeout(task, POLL) {
            if self.stop.load(Ordering::Acquire) {
                self.downloader.cancel_task(task);
                self.downloader.remove_task(task);
                return Err(InitError::Stopped);
            }
        }

        let status = self
            .downloader
            .task_status(task)
            .ok_or_else(|| InitError::Network(format!("{} disappeared", task)))?;
        self.downloader.remove_task(task);

        if status.state != TaskState::Finished || status.error.error_happened {
            return Err(InitError::Network(format!(
                "{} (http {}, errno {})",
                status.error.err_str, status.error.http_code, status.error.file_errno
            )));
        }
        Ok(status)
    }
}

/// Fetch and validate the remote index, reporting each step through `on_state`.
pub fn fetch_remote(
    fetcher: &Fetcher<'_>,
    cache_dir: &Path,
    on_state: &mut dyn FnMut(InitState),
) -> Result<RemoteIndex, InitError> {
    on_state(InitState::AskFooter);
    let size = fetcher.content_size()?;
    if size < FOOTER_SIZE {
        return Err(ArchiveError::Truncated {
            needed: FOOTER_SIZE,
            available: size,
        }
        .into());
    }

    on_state(InitState::GetFooter);
    let footer = PackFooter::parse(&fetcher.range(size - FOOTER_SIZE, FOOTER_SIZE)?)?;
    debug!(
        "Superpack {} bytes, {} files, meta {} bytes",
        size, footer.info.num_files, footer.meta_data_size
    );

    on_state(InitState::CompareLocalMeta);
    match load_cached(cache_dir) {
        Ok(Some(cached)) if cached.footer == footer => {
            info!("Remote index unchanged, using local copy");
            cached.table.check_data_end(footer.meta_offset(size)?)?;
            return Ok(cached);
        }
        Ok(_) => {}
        Err(e) => warn!("Ignoring local index copy: {}", e),
    }

    on_state(InitState::AskFileTable);
    let table_offset = footer.files_table_offset(size)?;
    on_state(InitState::GetFileTable);
    let table_bytes = fetcher.range(table_offset, footer.info.files_table_size as u64)?;
    let table = FileTable::parse(&table_bytes, &footer)?;

    on_state(InitState::AskMeta);
    if footer.meta_data_size == 0 {
        return Err(MetaError::Malformed("superpack carries no pack meta".into()).into());
    }
    let meta_offset = footer.meta_offset(size)?;
    table.check_data_end(meta_offset)?;
    on_state(InitState::GetMeta);
    let meta_bytes = fetcher.range(meta_offset, footer.meta_data_size as u64)?;
    check_meta_crc(&meta_bytes, &footer)?;

    on_state(InitState::UnpackMeta);
    let meta = PackMetaData::parse(&meta_bytes)?;

    if let Err(e) = write_cache(cache_dir, &footer, &table_bytes, &meta_bytes) {
        warn!("Failed to keep a local copy of the index: {}", e);
    }
    if let Err(e) = write_packs_db(&cache_dir.join(CACHE_PACKS_DB), &meta, &table.names) {
        warn!("Failed to write {}: {}", CACHE_PACKS_DB, e);
    }

    Ok(RemoteIndex { footer, table, meta })
}

/// Read the local copy of the index, if all of it is present.
pub fn load_cached(cache_dir: &Path) -> Result<Option<RemoteIndex>, InitError> {
    let paths = [CACHE_FOOTER, CACHE_FILE_TABLE, CACHE_META].map(|name| cache_dir.join(name));
    if !paths.iter().all(|p| p.is_file()) {
        return Ok(None);
    }

    let footer = PackFooter::parse(&fs::read(&paths[0]).map_err(ArchiveError::Io)?)?;
    let table = FileTable::parse(&fs::read(&paths[1]).map_err(ArchiveError::Io)?, &footer)?;
    let meta_bytes = fs::read(&paths[2]).map_err(ArchiveError::Io)?;
    check_meta_crc(&meta_bytes, &footer)?;
    let meta = PackMetaData::parse(&meta_bytes)?;

    Ok(Some(RemoteIndex { footer, table, meta }))
}

fn check_meta_crc(bytes: &[u8], footer: &PackFooter) -> Result<(), ArchiveError> {
    let actual = crc32(bytes);
    if actual != footer.meta_data_crc32 {
        return Err(ArchiveError::CrcMismatch {
            what: "meta block",
            expected: footer.meta_data_crc32,
            actual,
        });
    }
    Ok(())
}

fn write_cache(dir: &Path, footer: &PackFooter, table: &[u8], meta: &[u8]) -> std::io::Result<()> {
    let footer = footer.to_bytes();
    for (name, bytes) in [(CACHE_FOOTER, footer.as_slice()), (CACHE_FILE_TABLE, table), (CACHE_META, meta)] {
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{CompressionType, PackBuilder};
    use crate::downloader::DownloaderHints;
    use crate::test_server::TestServer;
    use tempfile::TempDir;

    fn superpack() -> Vec<u8> {
        let mut builder = PackBuilder::new();
        let base = builder.add_pack("base", &[]);
        let extra = builder.add_pack("extra", &[base]);
        builder
            .add_file("base/a.txt", &b"a".repeat(300), CompressionType::Lz4Hc, base)
            .add_file("extra/b.txt", &b"b".repeat(500), CompressionType::Rfc1951, extra);
        builder.build().unwrap()
    }

    #[test]
    fn test_fetch_then_reuse_cache() -> anyhow::Result<()> {
        let server = TestServer::start(superpack());
        let downloader = RangeDownloader::new(DownloaderHints::default())?;
        let dir = TempDir::new()?;
        let stop = AtomicBool::new(false);
        let url = server.url("/superpack.dvpk");
        let fetcher = Fetcher {
            downloader: &downloader,
            url: &url,
            stop: &stop,
        };

        let mut states = Vec::new();
        let remote = fetch_remote(&fetcher, dir.path(), &mut |s| states.push(s))?;
        assert_eq!(remote.table.names, vec!["base/a.txt", "extra/b.txt"]);
        assert_eq!(remote.meta.pack_count(), 2);
        assert!(states.contains(&InitState::GetMeta));
        assert!(dir.path().join(CACHE_PACKS_DB).is_file());

        let cached = load_cached(dir.path())?.expect("cache written");
        assert_eq!(cached.footer, remote.footer);

        // Unchanged footer: table and meta come from the copy
        let before = server.request_count();
        let mut states = Vec::new();
        fetch_remote(&fetcher, dir.path(), &mut |s| states.push(s))?;
        assert_eq!(server.request_count(), before + 2);
        assert!(states.contains(&InitState::CompareLocalMeta));
        assert!(!states.contains(&InitState::GetFileTable));
        assert_eq!(downloader.task_count(), 0);
        Ok(())
    }

    #[test]
    fn test_offline_server_is_a_network_error() -> anyhow::Result<()> {
        let server = TestServer::start(superpack());
        server.set_offline(true);
        let downloader = RangeDownloader::new(DownloaderHints::default())?;
        let dir = TempDir::new()?;
        let stop = AtomicBool::new(false);
        let url = server.url("/superpack.dvpk");
        let fetcher = Fetcher {
            downloader: &downloader,
            url: &url,
            stop: &stop,
        };

        let result = fetch_remote(&fetcher, dir.path(), &mut |_| {});
        assert!(matches!(result, Err(InitError::Network(_))));
        assert!(load_cached(dir.path())?.is_none());
        Ok(())
    }

    #[test]
    fn test_corrupt_cache_is_reported() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for name in [CACHE_FOOTER, CACHE_FILE_TABLE, CACHE_META] {
            fs::write(dir.path().join(name), b"not an index")?;
        }
        assert!(load_cached(dir.path()).is_err());
        Ok(())
    }
}
