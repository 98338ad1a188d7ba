//! In-memory pack index
//!
//! Built once per index load from the superpack's file table and meta
//! block (or from a local file-list database) and then shared read-only.

use std::collections::HashMap;

use crate::archive::pack::{FileTable, PackFooter};
use crate::archive::{CompressionType, FileInfo};
use crate::graph::{PackGraph, PackIndexEntry};
use crate::meta::db::LocalPacksDb;
use crate::meta::{MetaError, PackMetaData};

#[derive(Debug)]
pub struct PackIndex {
    graph: PackGraph,
    files: Vec<FileInfo>,
    by_path: HashMap<String, usize>,
    file_packs: Vec<u32>,
    files_by_pack: Vec<Vec<usize>>,
    footer: Option<PackFooter>,
    catalog_size: u64,
    /// Every pack, dependencies first.
    order: Vec<u32>,
}

impl PackIndex {
    /// Index of a remote superpack.
    pub fn from_superpack(
        table: &FileTable,
        meta: &PackMetaData,
        footer: PackFooter,
    ) -> Result<Self, MetaError> {
        Self::build(table.file_infos(), meta, Some(footer))
    }

    /// Index of a local file-list database. Sizes and offsets are unknown.
    pub fn from_local_db(db: &LocalPacksDb) -> Result<Self, MetaError> {
        let files = db
            .file_names()
            .iter()
            .map(|name| FileInfo {
                relative_file_path: name.clone(),
                compression_type: CompressionType::None,
                compressed_size: 0,
                original_size: 0,
                offset: 0,
                compressed_crc32: 0,
            })
            .collect();
        Self::build(files, db.meta(), None)
    }

    pub(super) fn build(files: Vec<FileInfo>, meta: &PackMetaData, footer: Option<PackFooter>) -> Result<Self, MetaError> {
        if files.len() != meta.file_count() {
            return Err(MetaError::Malformed(format!(
                "file table has {} files, meta describes {}",
                files.len(),
                meta.file_count()
            )));
        }

        let mut sizes = vec![0u64; meta.pack_count()];
        let mut files_by_pack = vec![Vec::new(); meta.pack_count()];
        for (i, file) in files.iter().enumerate() {
            let pack = meta.file_pack_index(i).unwrap_or(0) as usize;
            let slot = sizes.get_mut(pack).ok_or(MetaError::PackIndexOutOfRange {
                file: i,
                index: pack as u32,
                packs: meta.pack_count(),
            })?;
            *slot += file.original_size as u64;
            files_by_pack[pack].push(i);
        }

        let entries: Vec<PackIndexEntry> = meta
            .packs()
            .iter()
            .zip(&sizes)
            .map(|(pack, &size)| PackIndexEntry {
                name: pack.name.clone(),
                size_uncompressed: size,
                dependencies: pack.dependencies.clone(),
            })
            .collect();
        let graph = PackGraph::new(&entries)?;
        let all: Vec<u32> = (0..graph.len() as u32).collect();
        let order = graph.closure_indices(&all);

        let by_path = files
            .iter()
            .enumerate()
            .map(|(i, f)| (f.relative_file_path.clone(), i))
            .collect();

        Ok(Self {
            graph,
            catalog_size: sizes.iter().sum(),
            files,
            by_path,
            file_packs: meta.file_pack_indexes().to_vec(),
            files_by_pack,
            footer,
            order,
        })
    }

    pub fn graph(&self) -> &PackGraph {
        &self.graph
    }

    pub fn pack_count(&self) -> usize {
        self.graph.len()
    }

    pub fn pack_index(&self, name: &str) -> Option<u32> {
        self.graph.index_of(name)
    }

    /// Own uncompressed size of a pack.
    pub fn pack_size(&self, pack: u32) -> u64 {
        self.graph.size(pack)
    }

    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn file(&self, index: usize) -> &FileInfo {
        &self.files[index]
    }

    pub fn file_index(&self, relative_path: &str) -> Option<usize> {
        self.by_path.get(relative_path).copied()
    }

    pub fn file_pack(&self, index: usize) -> u32 {
        self.file_packs[index]
    }

    pub fn files_of(&self, pack: u32) -> &[usize] {
        &self.files_by_pack[pack as usize]
    }

    /// Every pack in acquisition order.
    pub fn acquisition_order(&self) -> &[u32] {
        &self.order
    }

    /// Footer of the superpack this index was read from.
    pub fn footer(&self) -> Option<&PackFooter> {
        self.footer.as_ref()
    }

    /// Uncompressed size of every file in the catalog.
    pub fn catalog_size(&self) -> u64 {
        self.catalog_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{PackArchive, PackBuilder, ResourceArchive};
    use tempfile::TempDir;

    #[test]
    fn test_pack_sizes_from_files() -> anyhow::Result<()> {
        let mut builder = PackBuilder::new();
        let base = builder.add_pack("base", &[]);
        let maps = builder.add_pack("maps", &[base]);
        builder
            .add_file("base/a.txt", &[1; 10], CompressionType::Lz4Hc, base)
            .add_file("base/b.txt", &[2; 5], CompressionType::None, base)
            .add_file("maps/m.sc2", &[3; 100], CompressionType::Rfc1951, maps);

        let dir = TempDir::new()?;
        let path = dir.path().join("superpack.dvpk");
        builder.write_to(&path)?;
        let archive = PackArchive::open(&path)?;
        let meta = archive.meta()?.unwrap();

        let table = FileTable {
            entries: archive.entries().to_vec(),
            names: archive.files().iter().map(|f| f.relative_file_path.clone()).collect(),
        };
        let index = PackIndex::from_superpack(&table, &meta, *archive.footer())?;

        assert_eq!(index.pack_count(), 2);
        assert_eq!(index.pack_size(base), 15);
        assert_eq!(index.pack_size(maps), 100);
        assert_eq!(index.catalog_size(), 115);
        assert_eq!(index.files_of(base).len(), 2);

        let m = index.file_index("maps/m.sc2").unwrap();
        assert_eq!(index.file_pack(m), maps);
        assert_eq!(index.file(m).compression_type, CompressionType::Rfc1951);
        assert!(index.file_index("maps").is_none());
        assert_eq!(index.acquisition_order(), &[base, maps]);
        Ok(())
    }
}
