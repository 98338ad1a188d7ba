//! `.dvpk` superpack reader and writer
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! [file data ...][meta block][files table][footer]
//! ```
//!
//! - footer: 36 bytes at the very end, finishing with the `DVPK` marker
//! - files table: one 32-byte [`FileTableEntry`] per file followed by the
//!   LZ4-compressed, NUL-terminated file names
//! - meta block: `met2` pack metadata (see [`crate::meta`]), may be empty
//!
//! Every trailing block carries a CRC32 in the footer so a client can fetch
//! footer, table and meta with three range requests and validate each.

use binrw::{BinRead, BinWrite};
use memmap2::Mmap;
use std::collections::HashMap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use super::{codec, ArchiveError, CompressionType, FileInfo, ResourceArchive};
use crate::hash::crc32;
use crate::meta::{PackDescription, PackMetaData};
use crate::paths::is_safe_relative;

/// Trailing marker of every superpack.
pub const PACK_MARKER: [u8; 4] = *b"DVPK";

/// Size of [`PackFooter`] on disk.
pub const FOOTER_SIZE: u64 = 36;

/// Size of [`FooterInfo`] on disk (the CRC-protected part of the footer).
pub const FOOTER_INFO_SIZE: usize = 24;

/// Size of one [`FileTableEntry`] on disk.
pub const FILE_ENTRY_SIZE: u64 = 32;

/// CRC-protected tail of the footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct FooterInfo {
    pub num_files: u32,
    pub names_size_compressed: u32,
    pub names_size_original: u32,
    /// Entries plus compressed names.
    pub files_table_size: u32,
    pub files_table_crc32: u32,
    pub marker: [u8; 4],
}

/// Superpack footer
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct PackFooter {
    pub meta_data_crc32: u32,
    pub meta_data_size: u32,
    /// CRC32 of the serialized [`FooterInfo`].
    pub info_crc32: u32,
    pub info: FooterInfo,
}

impl PackFooter {
    /// Parse and validate a footer from exactly its last [`FOOTER_SIZE`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, ArchiveError> {
        if (bytes.len() as u64) < FOOTER_SIZE {
            return Err(ArchiveError::Truncated {
                needed: FOOTER_SIZE,
                available: bytes.len() as u64,
            });
        }
        let tail = &bytes[bytes.len() - FOOTER_SIZE as usize..];

        let footer = PackFooter::read(&mut Cursor::new(tail))
            .map_err(|e| ArchiveError::Malformed(format!("footer: {}", e)))?;

        if footer.info.marker != PACK_MARKER {
            return Err(ArchiveError::BadMarker {
                expected: PACK_MARKER,
                found: footer.info.marker,
            });
        }

        let actual = crc32(&tail[12..]);
        if actual != footer.info_crc32 {
            return Err(ArchiveError::CrcMismatch {
                what: "footer info",
                expected: footer.info_crc32,
                actual,
            });
        }

        Ok(footer)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::with_capacity(FOOTER_SIZE as usize));
        // Writing plain integers into a Vec cannot fail
        let _ = self.write(&mut cursor);
        cursor.into_inner()
    }

    /// Byte offset of the files table in a superpack of `pack_size` bytes.
    pub fn files_table_offset(&self, pack_size: u64) -> Result<u64, ArchiveError> {
        let needed = FOOTER_SIZE + self.info.files_table_size as u64;
        pack_size.checked_sub(needed).ok_or(ArchiveError::Truncated {
            needed,
            available: pack_size,
        })
    }

    /// Byte offset of the meta block in a superpack of `pack_size` bytes.
    pub fn meta_offset(&self, pack_size: u64) -> Result<u64, ArchiveError> {
        let table = self.files_table_offset(pack_size)?;
        table
            .checked_sub(self.meta_data_size as u64)
            .ok_or(ArchiveError::Truncated {
                needed: FOOTER_SIZE + self.info.files_table_size as u64 + self.meta_data_size as u64,
                available: pack_size,
            })
    }
}

/// One file in the superpack table
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct FileTableEntry {
    pub start_position: u64,
    pub compressed_size: u32,
    pub original_size: u32,
    pub compressed_crc32: u32,
    pub compression_type: u32,
    pub original_crc32: u32,
    /// Index of the pack owning this file.
    pub meta_index: u32,
}

/// Parsed files table: entries plus their names, in table order.
#[derive(Debug, Clone)]
pub struct FileTable {
    pub entries: Vec<FileTableEntry>,
    pub names: Vec<String>,
}

impl FileTable {
    /// Parse the files table block described by `footer`.
    pub fn parse(block: &[u8], footer: &PackFooter) -> Result<Self, ArchiveError> {
        let info = &footer.info;
        if block.len() as u64 != info.files_table_size as u64 {
            return Err(ArchiveError::Truncated {
                needed: info.files_table_size as u64,
                available: block.len() as u64,
            });
        }

        let actual = crc32(block);
        if actual != info.files_table_crc32 {
            return Err(ArchiveError::CrcMismatch {
                what: "files table",
                expected: info.files_table_crc32,
                actual,
            });
        }

        let entries_size = info.num_files as u64 * FILE_ENTRY_SIZE;
        if entries_size + info.names_size_compressed as u64 != block.len() as u64 {
            return Err(ArchiveError::Malformed(format!(
                "files table size {} does not match {} entries and {} name bytes",
                block.len(),
                info.num_files,
                info.names_size_compressed
            )));
        }

        let mut cursor = Cursor::new(&block[..entries_size as usize]);
        let mut entries = Vec::with_capacity(info.num_files as usize);
        for _ in 0..info.num_files {
            let entry = FileTableEntry::read(&mut cursor)
                .map_err(|e| ArchiveError::Malformed(format!("file entry: {}", e)))?;
            CompressionType::from_u32(entry.compression_type)?;
            entries.push(entry);
        }

        let packed_names = &block[entries_size as usize..];
        let raw_names = codec::decompress(
            CompressionType::Lz4,
            packed_names,
            info.names_size_original as usize,
        )?;
        let names = split_names(&raw_names)?;

        if names.len() != entries.len() {
            return Err(ArchiveError::NameTableMismatch {
                expected: entries.len(),
                found: names.len(),
            });
        }

        for (entry, name) in entries.iter().zip(&names) {
            if !is_safe_relative(name) {
                return Err(ArchiveError::Malformed(format!("unsafe file name '{}'", name)));
            }
            // Offsets must stay addressable as signed range offsets
            let end = entry.start_position.checked_add(entry.compressed_size as u64);
            if end.map_or(true, |end| end > i64::MAX as u64) {
                return Err(ArchiveError::Malformed(format!(
                    "data of {} lies outside any pack (offset {})",
                    name, entry.start_position
                )));
            }
        }

        Ok(Self { entries, names })
    }

    /// Check every entry's data ends before `data_end` (the start of the meta block).
    pub fn check_data_end(&self, data_end: u64) -> Result<(), ArchiveError> {
        for (entry, name) in self.entries.iter().zip(&self.names) {
            let end = entry.start_position.checked_add(entry.compressed_size as u64);
            if end.map_or(true, |end| end > data_end) {
                return Err(ArchiveError::Malformed(format!(
                    "data of {} overlaps the trailing tables",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Flat file infos in table order.
    pub fn file_infos(&self) -> Vec<FileInfo> {
        self.entries
            .iter()
            .zip(&self.names)
            .map(|(entry, name)| FileInfo {
                relative_file_path: name.clone(),
                // Validated in parse()
                compression_type: CompressionType::from_u32(entry.compression_type)
                    .unwrap_or(CompressionType::None),
                compressed_size: entry.compressed_size,
                original_size: entry.original_size,
                offset: entry.start_position,
                compressed_crc32: entry.compressed_crc32,
            })
            .collect()
    }
}

fn split_names(raw: &[u8]) -> Result<Vec<String>, ArchiveError> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    if raw.last() != Some(&0) {
        return Err(ArchiveError::Malformed("file names not NUL terminated".into()));
    }
    raw[..raw.len() - 1]
        .split(|b| *b == 0)
        .map(|name| {
            String::from_utf8(name.to_vec())
                .map_err(|_| ArchiveError::Malformed("file name is not UTF-8".into()))
        })
        .collect()
}

/// Memory-mapped superpack
pub struct PackArchive {
    map: Mmap,
    footer: PackFooter,
    table: FileTable,
    infos: Vec<FileInfo>,
    by_name: HashMap<String, usize>,
}

impl PackArchive {
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_SIZE {
            return Err(ArchiveError::Truncated {
                needed: FOOTER_SIZE,
                available: len,
            });
        }

        // Memory-map the pack (OS manages paging, not loaded to RAM)
        let map = unsafe { Mmap::map(&file)? };

        let footer = PackFooter::parse(&map)?;
        let table_offset = footer.files_table_offset(len)? as usize;
        let meta_offset = footer.meta_offset(len)? as usize;
        let table = FileTable::parse(
            &map[table_offset..table_offset + footer.info.files_table_size as usize],
            &footer,
        )?;

        let meta = &map[meta_offset..table_offset];
        let actual = crc32(meta);
        if actual != footer.meta_data_crc32 {
            return Err(ArchiveError::CrcMismatch {
                what: "meta block",
                expected: footer.meta_data_crc32,
                actual,
            });
        }

        table.check_data_end(meta_offset as u64)?;
        let infos = table.file_infos();

        let by_name = infos
            .iter()
            .enumerate()
            .map(|(i, info)| (info.relative_file_path.clone(), i))
            .collect();

        Ok(Self {
            map,
            footer,
            table,
            infos,
            by_name,
        })
    }

    pub fn footer(&self) -> &PackFooter {
        &self.footer
    }

    pub fn entries(&self) -> &[FileTableEntry] {
        &self.table.entries
    }

    /// Raw `met2` block, empty when the pack carries no pack metadata.
    pub fn meta_bytes(&self) -> &[u8] {
        let len = self.map.len() as u64;
        // Offsets were validated in open()
        let start = self.footer.meta_offset(len).unwrap_or(0) as usize;
        let end = self.footer.files_table_offset(len).unwrap_or(0) as usize;
        &self.map[start..end]
    }

    /// Parsed pack metadata, if the superpack carries any.
    pub fn meta(&self) -> Result<Option<PackMetaData>, ArchiveError> {
        let bytes = self.meta_bytes();
        if bytes.is_empty() {
            return Ok(None);
        }
        PackMetaData::parse(bytes)
            .map(Some)
            .map_err(|e| ArchiveError::Malformed(format!("meta: {}", e)))
    }

    /// Stored (still compressed) bytes of a file.
    pub fn raw_data(&self, relative_path: &str) -> Option<&[u8]> {
        let info = self.file_info(relative_path)?;
        let start = info.offset as usize;
        Some(&self.map[start..start + info.compressed_size as usize])
    }
}

impl ResourceArchive for PackArchive {
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
        let Some(raw) = self.raw_data(relative_path) else {
            return Ok(false);
        };

        let actual = crc32(raw);
        if actual != info.compressed_crc32 {
            return Err(ArchiveError::CrcMismatch {
                what: "file data",
                expected: info.compressed_crc32,
                actual,
            });
        }

        *out = codec::decompress(info.compression_type, raw, info.original_size as usize)?;
        Ok(true)
    }
}

struct PendingFile {
    relative_path: String,
    data: Vec<u8>,
    compression: CompressionType,
    pack_index: u32,
}

/// Writes superpacks.
///
/// Packs are registered first; their indices are what files and
/// dependency lists refer to.
#[derive(Default)]
pub struct PackBuilder {
    packs: Vec<PackDescription>,
    files: Vec<PendingFile>,
}

impl PackBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pack and return its index.
    pub fn add_pack(&mut self, name: &str, dependencies: &[u32]) -> u32 {
        self.packs.push(PackDescription {
            name: name.to_string(),
            dependencies: dependencies.to_vec(),
        });
        (self.packs.len() - 1) as u32
    }

    pub fn add_file(
        &mut self,
        relative_path: &str,
        data: &[u8],
        compression: CompressionType,
        pack_index: u32,
    ) -> &mut Self {
        self.files.push(PendingFile {
            relative_path: relative_path.to_string(),
            data: data.to_vec(),
            compression,
            pack_index,
        });
        self
    }

    /// Serialize the whole superpack.
    pub fn build(&self) -> Result<Vec<u8>, ArchiveError> {
        let mut files: Vec<&PendingFile> = self.files.iter().collect();
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        for pair in files.windows(2) {
            if pair[0].relative_path == pair[1].relative_path {
                return Err(ArchiveError::Malformed(format!(
                    "duplicate file: {}",
                    pair[0].relative_path
                )));
            }
        }

        let mut out = Vec::new();
        let mut entries = Vec::with_capacity(files.len());
        let mut raw_names = Vec::new();

        for file in &files {
            if file.relative_path.as_bytes().contains(&0) {
                return Err(ArchiveError::Malformed("file name contains NUL".into()));
            }
            let stored = codec::compress(file.compression, &file.data)?;
            entries.push(FileTableEntry {
                start_position: out.len() as u64,
                compressed_size: size_u32(stored.len(), &file.relative_path)?,
                original_size: size_u32(file.data.len(), &file.relative_path)?,
                compressed_crc32: crc32(&stored),
                compression_type: file.compression as u32,
                original_crc32: crc32(&file.data),
                meta_index: file.pack_index,
            });
            out.extend_from_slice(&stored);
            raw_names.extend_from_slice(file.relative_path.as_bytes());
            raw_names.push(0);
        }

        let meta = if self.packs.is_empty() {
            Vec::new()
        } else {
            let file_packs = files.iter().map(|f| f.pack_index).collect();
            PackMetaData::new(self.packs.clone(), file_packs)
                .serialize()
                .map_err(|e| ArchiveError::Malformed(format!("meta: {}", e)))?
        };
        out.extend_from_slice(&meta);

        let mut table = Cursor::new(Vec::new());
        for entry in &entries {
            entry
                .write(&mut table)
                .map_err(|e| ArchiveError::Malformed(e.to_string()))?;
        }
        let mut table = table.into_inner();
        let packed_names = codec::compress(CompressionType::Lz4, &raw_names)?;
        table.extend_from_slice(&packed_names);
        out.extend_from_slice(&table);

        let info = FooterInfo {
            num_files: size_u32(entries.len(), "file count")?,
            names_size_compressed: size_u32(packed_names.len(), "name table")?,
            names_size_original: size_u32(raw_names.len(), "name table")?,
            files_table_size: size_u32(table.len(), "files table")?,
            files_table_crc32: crc32(&table),
            marker: PACK_MARKER,
        };
        let mut info_bytes = Cursor::new(Vec::with_capacity(FOOTER_INFO_SIZE));
        info.write(&mut info_bytes)
            .map_err(|e| ArchiveError::Malformed(e.to_string()))?;

        let footer = PackFooter {
            meta_data_crc32: crc32(&meta),
            meta_data_size: size_u32(meta.len(), "meta block")?,
            info_crc32: crc32(info_bytes.get_ref()),
            info,
        };
        out.extend_from_slice(&footer.to_bytes());
        Ok(out)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ArchiveError> {
        std::fs::write(path, self.build()?)?;
        Ok(())
    }
}

fn size_u32(len: usize, what: &str) -> Result<u32, ArchiveError> {
    u32::try_from(len).map_err(|_| ArchiveError::Malformed(format!("{} too large: {} bytes", what, len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_builder() -> PackBuilder {
        let mut builder = PackBuilder::new();
        let base = builder.add_pack("base", &[]);
        let maps = builder.add_pack("maps", &[base]);
        builder
            .add_file("3d/Maps/map.sc2", &b"map data ".repeat(300), CompressionType::Lz4Hc, maps)
            .add_file("ui/readme.txt", b"plain", CompressionType::None, base)
            .add_file("ui/font.fnt", &b"glyph".repeat(100), CompressionType::Lz4, base);
        builder
    }

    #[test]
    fn test_round_trip_lz4hc() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("test.dvpk");
        sample_builder().write_to(&path)?;

        let bytes = std::fs::read(&path)?;
        assert_eq!(&bytes[bytes.len() - 4..], b"DVPK");

        let archive = PackArchive::open(&path)?;
        assert_eq!(archive.files().len(), 3);
        assert!(archive.has_file("3d/Maps/map.sc2"));
        assert!(!archive.has_file("3d/Maps/missing.sc2"));

        let info = archive.file_info("3d/Maps/map.sc2").unwrap();
        assert_eq!(info.compression_type, CompressionType::Lz4Hc);
        assert_eq!(info.original_size, 2700);
        assert!(info.compressed_size < info.original_size);

        let mut out = Vec::new();
        assert!(archive.load_file("3d/Maps/map.sc2", &mut out)?);
        assert_eq!(out, b"map data ".repeat(300));
        assert!(archive.load_file("ui/readme.txt", &mut out)?);
        assert_eq!(out, b"plain");
        assert!(!archive.load_file("nope", &mut out)?);

        let meta = archive.meta()?.unwrap();
        assert_eq!(meta.pack_count(), 2);
        assert_eq!(meta.file_pack_index(0), Some(1));
        Ok(())
    }

    #[test]
    fn test_footer_offsets() -> anyhow::Result<()> {
        let bytes = sample_builder().build()?;
        let footer = PackFooter::parse(&bytes)?;
        let len = bytes.len() as u64;
        let table_offset = footer.files_table_offset(len)? as usize;
        let meta_offset = footer.meta_offset(len)? as usize;

        let table = FileTable::parse(
            &bytes[table_offset..table_offset + footer.info.files_table_size as usize],
            &footer,
        )?;
        assert_eq!(table.names, vec!["3d/Maps/map.sc2", "ui/font.fnt", "ui/readme.txt"]);
        assert_eq!(&bytes[meta_offset..meta_offset + 4], b"met2");
        Ok(())
    }

    #[test]
    fn test_truncated_pack_is_structural_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let bytes = sample_builder().build()?;

        let short = dir.path().join("short.dvpk");
        std::fs::write(&short, &bytes[..20])?;
        assert!(matches!(
            PackArchive::open(&short),
            Err(ArchiveError::Truncated { .. })
        ));

        // Chop the data region: the footer still parses but the tables no longer fit
        let chopped = dir.path().join("chopped.dvpk");
        std::fs::write(&chopped, &bytes[bytes.len() - 60..])?;
        assert!(PackArchive::open(&chopped).is_err());
        Ok(())
    }

    #[test]
    fn test_corrupt_table_is_detected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let mut bytes = sample_builder().build()?;
        let footer = PackFooter::parse(&bytes)?;
        let table_offset = footer.files_table_offset(bytes.len() as u64)? as usize;
        bytes[table_offset + 3] ^= 0xff;

        let path = dir.path().join("corrupt.dvpk");
        std::fs::write(&path, &bytes)?;
        assert!(matches!(
            PackArchive::open(&path),
            Err(ArchiveError::CrcMismatch { what: "files table", .. })
        ));

        let mut bad_marker = sample_builder().build()?;
        let n = bad_marker.len();
        bad_marker[n - 1] = b'X';
        assert!(matches!(
            PackFooter::parse(&bad_marker),
            Err(ArchiveError::BadMarker { .. })
        ));
        Ok(())
    }

    /// Rewrite the first entry's offset and re-seal the table and footer CRCs.
    fn with_first_offset(mut bytes: Vec<u8>, offset: u64) -> anyhow::Result<Vec<u8>> {
        let mut footer = PackFooter::parse(&bytes)?;
        let table_offset = footer.files_table_offset(bytes.len() as u64)? as usize;
        let table_end = table_offset + footer.info.files_table_size as usize;
        bytes[table_offset..table_offset + 8].copy_from_slice(&offset.to_le_bytes());

        footer.info.files_table_crc32 = crc32(&bytes[table_offset..table_end]);
        let mut info = Cursor::new(Vec::new());
        footer.info.write(&mut info).map_err(|e| anyhow::anyhow!("footer info: {}", e))?;
        footer.info_crc32 = crc32(info.get_ref());

        let tail = bytes.len() - FOOTER_SIZE as usize;
        bytes[tail..].copy_from_slice(&footer.to_bytes());
        Ok(bytes)
    }

    #[test]
    fn test_out_of_range_offsets_are_malformed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let bytes = sample_builder().build()?;
        let footer = PackFooter::parse(&bytes)?;
        let data_end = footer.meta_offset(bytes.len() as u64)?;

        let wrapped = dir.path().join("wrapped.dvpk");
        std::fs::write(&wrapped, with_first_offset(bytes.clone(), u64::MAX - 2)?)?;
        assert!(matches!(PackArchive::open(&wrapped), Err(ArchiveError::Malformed(_))));

        let past_data = dir.path().join("past_data.dvpk");
        std::fs::write(&past_data, with_first_offset(bytes, data_end)?)?;
        assert!(matches!(PackArchive::open(&past_data), Err(ArchiveError::Malformed(_))));
        Ok(())
    }

    #[test]
    fn test_unsafe_names_are_malformed() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        for name in ["../escape.bin", "/tmp/abs_escape.bin", "ui\\..\\escape.bin"] {
            let mut builder = PackBuilder::new();
            let pack = builder.add_pack("p", &[]);
            builder.add_file(name, b"payload", CompressionType::None, pack);
            let bytes = builder.build()?;

            let footer = PackFooter::parse(&bytes)?;
            let table_offset = footer.files_table_offset(bytes.len() as u64)? as usize;
            let table = &bytes[table_offset..table_offset + footer.info.files_table_size as usize];
            assert!(matches!(FileTable::parse(table, &footer), Err(ArchiveError::Malformed(_))), "{}", name);

            let path = dir.path().join("unsafe.dvpk");
            std::fs::write(&path, &bytes)?;
            assert!(PackArchive::open(&path).is_err());
        }
        Ok(())
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_size_fields_reject_overflow() {
        assert_eq!(size_u32(1024, "entry").ok(), Some(1024));
        assert!(matches!(size_u32(u32::MAX as usize + 1, "entry"), Err(ArchiveError::Malformed(_))));
    }
}
