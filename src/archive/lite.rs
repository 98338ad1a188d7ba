//! `.dvpl` lite files: one compressed file with a trailing footer.
//!
//! The pack store keeps every downloaded file in this form, exactly as it
//! was stored in the superpack plus a 20-byte footer, so a store entry can
//! be validated without decompressing it.

use binrw::{BinRead, BinWrite};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{codec, ArchiveError, CompressionType};
use crate::hash::crc32;

/// Trailing marker of lite files.
pub const LITE_MARKER: [u8; 4] = *b"DVPL";

/// Size of [`LiteFooter`] on disk.
pub const LITE_FOOTER_SIZE: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct LiteFooter {
    pub original_size: u32,
    pub compressed_size: u32,
    pub compressed_crc32: u32,
    pub compression_type: u32,
    pub marker: [u8; 4],
}

impl LiteFooter {
    pub fn new(
        original_size: u32,
        compressed_size: u32,
        compressed_crc32: u32,
        compression: CompressionType,
    ) -> Self {
        Self {
            original_size,
            compressed_size,
            compressed_crc32,
            compression_type: compression as u32,
            marker: LITE_MARKER,
        }
    }

    fn parse(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let footer = LiteFooter::read(&mut Cursor::new(bytes))
            .map_err(|e| ArchiveError::Malformed(format!("lite footer: {}", e)))?;
        if footer.marker != LITE_MARKER {
            return Err(ArchiveError::BadMarker {
                expected: LITE_MARKER,
                found: footer.marker,
            });
        }
        CompressionType::from_u32(footer.compression_type)?;
        Ok(footer)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::with_capacity(LITE_FOOTER_SIZE as usize));
        // Writing plain integers into a Vec cannot fail
        let _ = self.write(&mut cursor);
        cursor.into_inner()
    }

    pub fn compression(&self) -> CompressionType {
        CompressionType::from_u32(self.compression_type).unwrap_or(CompressionType::None)
    }
}

/// Read and sanity-check the footer of a lite file without reading its body.
pub fn read_footer(path: &Path) -> Result<LiteFooter, ArchiveError> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < LITE_FOOTER_SIZE {
        return Err(ArchiveError::Truncated {
            needed: LITE_FOOTER_SIZE,
            available: len,
        });
    }

    file.seek(SeekFrom::Start(len - LITE_FOOTER_SIZE))?;
    let mut buf = [0u8; LITE_FOOTER_SIZE as usize];
    file.read_exact(&mut buf)?;
    let footer = LiteFooter::parse(&buf)?;

    if footer.compressed_size as u64 + LITE_FOOTER_SIZE != len {
        return Err(ArchiveError::Malformed(format!(
            "{}: body is {} bytes, footer says {}",
            path.display(),
            len - LITE_FOOTER_SIZE,
            footer.compressed_size
        )));
    }
    Ok(footer)
}

/// Append a footer to a file holding exactly the compressed body.
pub fn append_footer(path: &Path, footer: &LiteFooter) -> Result<(), ArchiveError> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    file.write_all(&footer.to_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Compress `data` and write it as a lite file.
pub fn write(path: &Path, data: &[u8], compression: CompressionType) -> Result<LiteFooter, ArchiveError> {
    let body = codec::compress(compression, data)?;
    let footer = LiteFooter::new(data.len() as u32, body.len() as u32, crc32(&body), compression);
    let mut file = File::create(path)?;
    file.write_all(&body)?;
    file.write_all(&footer.to_bytes())?;
    Ok(footer)
}

/// Verify and decompress a lite file.
pub fn load(path: &Path) -> Result<Vec<u8>, ArchiveError> {
    let bytes = std::fs::read(path)?;
    if (bytes.len() as u64) < LITE_FOOTER_SIZE {
        return Err(ArchiveError::Truncated {
            needed: LITE_FOOTER_SIZE,
            available: bytes.len() as u64,
        });
    }
    let split = bytes.len() - LITE_FOOTER_SIZE as usize;
    let footer = LiteFooter::parse(&bytes[split..])?;
    let body = &bytes[..split];

    if body.len() != footer.compressed_size as usize {
        return Err(ArchiveError::Malformed(format!(
            "{}: body is {} bytes, footer says {}",
            path.display(),
            body.len(),
            footer.compressed_size
        )));
    }
    let actual = crc32(body);
    if actual != footer.compressed_crc32 {
        return Err(ArchiveError::CrcMismatch {
            what: "lite body",
            expected: footer.compressed_crc32,
            actual,
        });
    }

    codec::decompress(footer.compression(), body, footer.original_size as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_load() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("font.fnt.dvpl");
        let data = b"glyph table ".repeat(200);

        let written = write(&path, &data, CompressionType::Lz4Hc)?;
        assert_eq!(read_footer(&path)?, written);
        assert_eq!(load(&path)?, data);
        Ok(())
    }

    #[test]
    fn test_append_footer_to_downloaded_body() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("a.txt.dvpl");
        let data = b"deflated body ".repeat(50);
        let body = codec::compress(CompressionType::Rfc1951, &data)?;
        std::fs::write(&path, &body)?;

        let footer = LiteFooter::new(
            data.len() as u32,
            body.len() as u32,
            crc32(&body),
            CompressionType::Rfc1951,
        );
        append_footer(&path, &footer)?;
        assert_eq!(load(&path)?, data);
        Ok(())
    }

    #[test]
    fn test_damaged_files_are_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("b.dvpl");
        write(&path, b"0123456789abcdef", CompressionType::None)?;

        let mut bytes = std::fs::read(&path)?;
        bytes[0] ^= 0x55;
        std::fs::write(&path, &bytes)?;
        assert!(matches!(load(&path), Err(ArchiveError::CrcMismatch { .. })));

        std::fs::write(&path, b"short")?;
        assert!(matches!(read_footer(&path), Err(ArchiveError::Truncated { .. })));

        std::fs::write(&path, [0u8; 40])?;
        assert!(matches!(read_footer(&path), Err(ArchiveError::BadMarker { .. })));
        Ok(())
    }
}
