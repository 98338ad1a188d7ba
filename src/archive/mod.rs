//! Resource archive readers.
//!
//! Two container formats share one flat file table abstraction:
//! - `.dvpk` superpacks (see [`pack`]), the format served by the CDN
//! - plain `.zip` archives via the zip crate (see [`zip_archive`])
//!
//! Single compressed files in the local pack store use the `.dvpl` lite
//! format (see [`lite`]).

pub mod codec;
pub mod lite;
pub mod pack;
pub mod zip_archive;

use std::fs::File;
use std::io::Read;
use std::path::Path;

pub use pack::{PackArchive, PackBuilder};
pub use zip_archive::ZipResourceArchive;

/// Compression applied to a single stored file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CompressionType {
    None = 0,
    Lz4 = 1,
    Lz4Hc = 2,
    Rfc1951 = 3,
}

impl CompressionType {
    pub fn from_u32(value: u32) -> Result<Self, ArchiveError> {
        match value {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Lz4),
            2 => Ok(CompressionType::Lz4Hc),
            3 => Ok(CompressionType::Rfc1951),
            other => Err(ArchiveError::UnknownCompression(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
            CompressionType::Lz4Hc => "lz4hc",
            CompressionType::Rfc1951 => "rfc1951",
        }
    }
}

/// One entry of an archive's flat file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub relative_file_path: String,
    pub compression_type: CompressionType,
    pub compressed_size: u32,
    pub original_size: u32,
    /// Byte offset of the stored data within the container.
    pub offset: u64,
    pub compressed_crc32: u32,
}

/// Structural errors while reading archives.
///
/// A missing file is not an error: lookups return `Ok(false)` / `None`.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("archive truncated: need {needed} bytes, have {available}")]
    Truncated { needed: u64, available: u64 },

    #[error("bad marker: expected {expected:?}, found {found:?}")]
    BadMarker { expected: [u8; 4], found: [u8; 4] },

    #[error("{what} crc32 mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch {
        what: &'static str,
        expected: u32,
        actual: u32,
    },

    #[error("file name table holds {found} names, table has {expected} entries")]
    NameTableMismatch { expected: usize, found: usize },

    #[error("unknown compression type: {0}")]
    UnknownCompression(u32),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("malformed archive: {0}")]
    Malformed(String),

    #[error("zip error: {0}")]
    Zip(#[from] ::zip::result::ZipError),
}

/// Read-only view of a container with a flat file table.
pub trait ResourceArchive: Send + Sync {
    /// Every file in table order.
    fn files(&self) -> &[FileInfo];

    fn file_info(&self, relative_path: &str) -> Option<&FileInfo>;

    fn has_file(&self, relative_path: &str) -> bool {
        self.file_info(relative_path).is_some()
    }

    /// Decompress a file into `out` (replacing its contents).
    ///
    /// Returns `Ok(false)` if the name is not in the table.
    fn load_file(&self, relative_path: &str, out: &mut Vec<u8>) -> Result<bool, ArchiveError>;
}

/// Open an archive, picking the format from its signature.
///
/// Zip archives start with `PK`; anything else must carry a superpack footer.
pub fn open_archive(path: &Path) -> Result<Box<dyn ResourceArchive>, ArchiveError> {
    let mut signature = [0u8; 2];
    let mut file = File::open(path)?;
    let is_zip = file.read_exact(&mut signature).is_ok() && &signature == b"PK";
    drop(file);

    if is_zip {
        Ok(Box::new(ZipResourceArchive::open(path)?))
    } else {
        Ok(Box::new(PackArchive::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compression_tags() {
        for tag in 0..4 {
            let kind = CompressionType::from_u32(tag).unwrap();
            assert_eq!(kind as u32, tag);
        }
        assert!(matches!(
            CompressionType::from_u32(9),
            Err(ArchiveError::UnknownCompression(9))
        ));
    }
}
