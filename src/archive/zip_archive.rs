//! Zip resource archives (zip crate)

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;
use zip::{CompressionMethod, ZipArchive};

use super::{ArchiveError, CompressionType, FileInfo, ResourceArchive};

/// Zip archive exposing the shared flat file table.
///
/// Stored entries report [`CompressionType::None`], deflated ones
/// [`CompressionType::Rfc1951`]. `compressed_crc32` carries the CRC the zip
/// directory records, which covers the uncompressed data.
pub struct ZipResourceArchive {
    archive: Mutex<ZipArchive<BufReader<File>>>,
    infos: Vec<FileInfo>,
    by_name: HashMap<String, usize>,
}

impl ZipResourceArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let mut archive = ZipArchive::new(BufReader::new(file))?;

        let mut infos = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let entry = archive.by_index_raw(i)?;
            if entry.is_dir() {
                continue;
            }

            let compression_type = match entry.compression() {
                CompressionMethod::Stored => CompressionType::None,
                CompressionMethod::Deflated => CompressionType::Rfc1951,
                other => {
                    return Err(ArchiveError::Malformed(format!(
                        "unsupported zip compression {:?} for {}",
                        other,
                        entry.name()
                    )))
                }
            };

            infos.push(FileInfo {
                relative_file_path: entry.name().to_string(),
                compression_type,
                compressed_size: entry_size(entry.compressed_size(), entry.name())?,
                original_size: entry_size(entry.size(), entry.name())?,
                offset: entry.header_start(),
                compressed_crc32: entry.crc32(),
            });
        }

        debug!("Opened zip {} with {} files", path.display(), infos.len());

        let by_name = infos
            .iter()
            .enumerate()
            .map(|(i, info)| (info.relative_file_path.clone(), i))
            .collect();

        Ok(Self {
            archive: Mutex::new(archive),
            infos,
            by_name,
        })
    }
}

/// Entries past 4 GiB don't fit the 32-bit sizes of [`FileInfo`].
fn entry_size(size: u64, name: &str) -> Result<u32, ArchiveError> {
    u32::try_from(size).map_err(|_| ArchiveError::Malformed(format!("{} is too large: {} bytes", name, size)))
}

impl ResourceArchive for ZipResourceArchive {
    fn files(&self) -> &[FileInfo] {
        &self.infos
    }

    fn file_info(&self, relative_path: &str) -> Option<&FileInfo> {
        self.by_name.get(relative_path).map(|&i| &self.infos[i])
    }

    fn load_file(&self, relative_path: &str, out: &mut Vec<u8>) -> Result<bool, ArchiveError> {
        let Some(info) = self.file_info(relative_path) else {
            return Ok(false);
        };

        let mut archive = self
            .archive
            .lock()
            .map_err(|_| ArchiveError::Malformed("zip reader poisoned".into()))?;
        let mut entry = archive.by_name(relative_path)?;

        out.clear();
        out.reserve(info.original_size as usize);
        entry.read_to_end(out)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    #[test]
    fn test_round_trip_deflate() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("source.txt");
        let content = b"zip resource archive content\n".repeat(64);
        std::fs::write(&source, &content)?;

        let zip_path = dir.path().join("test.zip");
        let mut writer = ZipWriter::new(File::create(&zip_path)?);
        let deflated = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.add_directory("data/", stored)?;
        writer.start_file("data/source.txt", deflated)?;
        writer.write_all(&std::fs::read(&source)?)?;
        writer.start_file("data/raw.bin", stored)?;
        writer.write_all(b"raw")?;
        writer.finish()?;

        let archive = ZipResourceArchive::open(&zip_path)?;
        assert_eq!(archive.files().len(), 2);

        let info = archive.file_info("data/source.txt").unwrap();
        assert_eq!(info.compression_type, CompressionType::Rfc1951);
        assert_eq!(info.original_size as usize, content.len());
        assert_eq!(
            archive.file_info("data/raw.bin").unwrap().compression_type,
            CompressionType::None
        );

        let mut out = Vec::new();
        assert!(archive.load_file("data/source.txt", &mut out)?);
        assert_eq!(out, std::fs::read(&source)?);
        assert!(!archive.load_file("data/missing.txt", &mut out)?);
        Ok(())
    }

    #[test]
    fn test_garbage_is_structural_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("broken.zip");
        std::fs::write(&path, b"PK\x03\x04 this is not really a zip")?;
        assert!(ZipResourceArchive::open(&path).is_err());

        let opened = crate::archive::open_archive(&path);
        assert!(opened.is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_entry_is_malformed() {
        assert_eq!(entry_size(u32::MAX as u64, "big.bin").ok(), Some(u32::MAX));
        assert!(matches!(
            entry_size(u32::MAX as u64 + 1, "huge.bin"),
            Err(ArchiveError::Malformed(_))
        ));
    }
}
