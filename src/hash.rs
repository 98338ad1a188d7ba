//! CRC32 helpers for pack verification.
//!
//! Superpack tables, cached index blocks and downloaded pack files are all
//! checked with the standard (zlib) CRC32. Files are hashed in a streaming
//! fashion so multi-GB store entries never need to be loaded into memory.

use anyhow::{Context, Result};
use flate2::Crc;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// CRC32 of an in-memory buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Compute CRC32 of a file.
///
/// Uses streaming to handle large files without loading into memory.
pub fn compute_file_crc32(path: &Path) -> Result<u32> {
    let (crc, _) = compute_file_crc32_prefix(path, u64::MAX)?;
    Ok(crc)
}

/// Compute CRC32 over the first `limit` bytes of a file.
///
/// Returns the checksum and the number of bytes actually hashed, which is
/// smaller than `limit` when the file is shorter.
pub fn compute_file_crc32_prefix(path: &Path, limit: u64) -> Result<(u32, u64)> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;

    let mut reader = BufReader::with_capacity(1024 * 1024, file).take(limit); // 1MB buffer
    let mut buf = vec![0u8; 1024 * 1024]; // 1MB chunks
    let mut crc = Crc::new();

    loop {
        let bytes_read = reader
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;

        if bytes_read == 0 {
            break;
        }

        crc.update(&buf[..bytes_read]);
    }

    Ok((crc.sum(), crc.amount() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_crc32_known_value() {
        // Standard check value for CRC-32/ISO-HDLC
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_file_crc_matches_buffer_crc() -> Result<()> {
        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = NamedTempFile::new()?;
        file.write_all(&data)?;
        file.flush()?;

        assert_eq!(compute_file_crc32(file.path())?, crc32(&data));

        let (prefix_crc, hashed) = compute_file_crc32_prefix(file.path(), 10)?;
        assert_eq!(hashed, 10);
        assert_eq!(prefix_crc, crc32(&data[..10]));
        Ok(())
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(compute_file_crc32(Path::new("/nonexistent/file.dvpl")).is_err());
    }
}
