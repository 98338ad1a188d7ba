//! Pack metadata (`met2` block)
//!
//! The meta block stored in every superpack maps each file (by table index)
//! to the pack owning it and lists every pack with its direct dependencies:
//!
//! ```text
//! "met2"
//! num_files u32, num_files × pack_index u32
//! uncompressed_size u32, compressed_size u32
//! LZ4 block of lines: "<pack name> <dep>, <dep>\n"
//! num_rows u32, num_rows × { pack_index u32, count u32, count × dep u32 }
//! ```
//!
//! The trailing rows hold each pack's transitive dependencies (packs with
//! none are omitted) so readers don't need to recompute them.

pub mod db;

use binrw::{BinRead, BinWrite};
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use crate::archive::{codec, CompressionType};
use crate::graph::{GraphError, PackGraph};

/// Pack metadata errors
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    #[error("not a met2 block")]
    BadHeader,

    #[error("meta block truncated: {0}")]
    Truncated(&'static str),

    #[error("malformed meta block: {0}")]
    Malformed(String),

    #[error("bad dependency index '{0}'")]
    BadDependency(String),

    #[error("file {file} refers to pack {index}, only {packs} packs exist")]
    PackIndexOutOfRange { file: usize, index: u32, packs: usize },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little, magic = b"met2")]
struct RawMeta {
    num_files: u32,
    #[br(count = num_files)]
    file_packs: Vec<u32>,
    uncompressed_size: u32,
    compressed_size: u32,
    #[br(count = compressed_size)]
    packed_lines: Vec<u8>,
    num_rows: u32,
    #[br(count = num_rows)]
    rows: Vec<DependencyRow>,
}

#[derive(Debug, BinRead, BinWrite)]
#[brw(little)]
struct DependencyRow {
    pack_index: u32,
    count: u32,
    #[br(count = count)]
    dependencies: Vec<u32>,
}

/// A named pack and the indices of the packs it directly depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackDescription {
    pub name: String,
    /// Sorted, without duplicates.
    pub dependencies: Vec<u32>,
}

/// Parsed pack metadata.
#[derive(Debug, Clone)]
pub struct PackMetaData {
    packs: Vec<PackDescription>,
    file_packs: Vec<u32>,
    transitive: Vec<Vec<u32>>,
    by_name: HashMap<String, u32>,
}

impl PackMetaData {
    pub fn new(packs: Vec<PackDescription>, file_packs: Vec<u32>) -> Self {
        let packs: Vec<PackDescription> = packs
            .into_iter()
            .map(|mut p| {
                sort_and_dedup(&mut p.dependencies);
                p
            })
            .collect();
        let by_name = name_map(&packs);
        Self {
            transitive: vec![Vec::new(); packs.len()],
            packs,
            file_packs,
            by_name,
        }
    }

    /// Parse a `met2` block.
    pub fn parse(bytes: &[u8]) -> Result<Self, MetaError> {
        check_counts(bytes)?;

        let raw = RawMeta::read(&mut Cursor::new(bytes)).map_err(|e| match e {
            binrw::Error::BadMagic { .. } => MetaError::BadHeader,
            other => MetaError::Malformed(other.to_string()),
        })?;

        let text = codec::decompress(
            CompressionType::Lz4,
            &raw.packed_lines,
            raw.uncompressed_size as usize,
        )
        .map_err(|e| MetaError::Malformed(format!("pack list: {}", e)))?;
        let text = String::from_utf8(text)
            .map_err(|_| MetaError::Malformed("pack list is not UTF-8".into()))?;

        let packs = text
            .lines()
            .filter(|line| !line.is_empty())
            .map(parse_line)
            .collect::<Result<Vec<_>, _>>()?;

        for (file, &index) in raw.file_packs.iter().enumerate() {
            if index as usize >= packs.len() {
                return Err(MetaError::PackIndexOutOfRange {
                    file,
                    index,
                    packs: packs.len(),
                });
            }
        }

        let mut transitive = vec![Vec::new(); packs.len()];
        for row in raw.rows {
            let slot = transitive.get_mut(row.pack_index as usize).ok_or_else(|| {
                MetaError::Malformed(format!("dependency row for unknown pack {}", row.pack_index))
            })?;
            *slot = row.dependencies;
            sort_and_dedup(slot);
        }

        let by_name = name_map(&packs);
        Ok(Self {
            packs,
            file_packs: raw.file_packs,
            transitive,
            by_name,
        })
    }

    /// Serialize to a `met2` block.
    ///
    /// Fails if the dependency lists contain a cycle or dangling index.
    pub fn serialize(&self) -> Result<Vec<u8>, MetaError> {
        let mut text = String::new();
        for pack in &self.packs {
            text.push_str(&pack.name);
            text.push(' ');
            let deps: Vec<String> = pack.dependencies.iter().map(|d| d.to_string()).collect();
            text.push_str(&deps.join(", "));
            text.push('\n');
        }
        let packed = codec::compress(CompressionType::Lz4, text.as_bytes())
            .map_err(|e| MetaError::Malformed(e.to_string()))?;

        let graph = PackGraph::from_dependencies(
            self.packs.iter().map(|p| p.dependencies.clone()).collect(),
        )?;
        let rows: Vec<DependencyRow> = (0..self.packs.len() as u32)
            .filter_map(|i| {
                let deps = graph.dependencies(i);
                (!deps.is_empty()).then(|| DependencyRow {
                    pack_index: i,
                    count: deps.len() as u32,
                    dependencies: deps,
                })
            })
            .collect();

        let raw = RawMeta {
            num_files: self.file_packs.len() as u32,
            file_packs: self.file_packs.clone(),
            uncompressed_size: text.len() as u32,
            compressed_size: packed.len() as u32,
            packed_lines: packed,
            num_rows: rows.len() as u32,
            rows,
        };

        let mut out = Cursor::new(Vec::new());
        raw.write(&mut out)
            .map_err(|e| MetaError::Malformed(e.to_string()))?;
        Ok(out.into_inner())
    }

    pub fn pack_count(&self) -> usize {
        self.packs.len()
    }

    pub fn packs(&self) -> &[PackDescription] {
        &self.packs
    }

    pub fn pack(&self, index: u32) -> Option<&PackDescription> {
        self.packs.get(index as usize)
    }

    pub fn pack_index(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn has_pack(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn file_count(&self) -> usize {
        self.file_packs.len()
    }

    pub fn file_pack_index(&self, file_index: usize) -> Option<u32> {
        self.file_packs.get(file_index).copied()
    }

    pub fn file_pack_indexes(&self) -> &[u32] {
        &self.file_packs
    }

    /// File table indices of every file in a pack.
    pub fn file_indexes(&self, pack_index: u32) -> Vec<u32> {
        self.file_packs
            .iter()
            .enumerate()
            .filter(|(_, &p)| p == pack_index)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Transitive dependencies as recorded in the block (empty for built metadata).
    pub fn recorded_dependencies(&self, pack_index: u32) -> &[u32] {
        self.transitive
            .get(pack_index as usize)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

/// Path lookup tree over `/`-separated file names.
///
/// Directory prefixes of a stored file are found as well.
#[derive(Debug, Default, Clone)]
pub struct FileNamesTree {
    root: Node,
}

#[derive(Debug, Default, Clone)]
struct Node {
    children: BTreeMap<String, Node>,
}

impl FileNamesTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, relative_path: &str) {
        let mut node = &mut self.root;
        for element in relative_path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.entry(element.to_string()).or_default();
        }
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        let mut node = &self.root;
        let mut any = false;
        for element in relative_path.split('/').filter(|s| !s.is_empty()) {
            match node.children.get(element) {
                Some(child) => node = child,
                None => return false,
            }
            any = true;
        }
        any
    }
}

impl<'a> FromIterator<&'a str> for FileNamesTree {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut tree = FileNamesTree::new();
        for path in iter {
            tree.add(path);
        }
        tree
    }
}

fn parse_line(line: &str) -> Result<PackDescription, MetaError> {
    let (name, deps) = line
        .split_once(' ')
        .ok_or_else(|| MetaError::Malformed(format!("can't parse pack line '{}'", line)))?;
    if name.is_empty() {
        return Err(MetaError::Malformed(format!("empty pack name in '{}'", line)));
    }
    Ok(PackDescription {
        name: name.to_string(),
        dependencies: parse_dependency_list(deps)?,
    })
}

/// Parse a `", "`-separated list of pack indices.
pub fn parse_dependency_list(deps: &str) -> Result<Vec<u32>, MetaError> {
    let mut out = deps
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|_| MetaError::BadDependency(s.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    sort_and_dedup(&mut out);
    Ok(out)
}

fn sort_and_dedup(v: &mut Vec<u32>) {
    v.sort_unstable();
    v.dedup();
}

fn name_map(packs: &[PackDescription]) -> HashMap<String, u32> {
    packs
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.clone(), i as u32))
        .collect()
}

/// Reject counts that can't fit in the block before allocating for them.
fn check_counts(bytes: &[u8]) -> Result<(), MetaError> {
    let read_u32 = |at: usize| -> Option<u32> {
        bytes
            .get(at..at + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    let num_files = read_u32(4).ok_or(MetaError::Truncated("num_files"))? as usize;
    let sizes_at = 8 + num_files * 4;
    if sizes_at + 8 > bytes.len() {
        return Err(MetaError::Truncated("file pack indexes"));
    }
    let compressed = read_u32(sizes_at + 4).ok_or(MetaError::Truncated("compressed_size"))? as usize;
    if sizes_at + 8 + compressed + 4 > bytes.len() {
        return Err(MetaError::Truncated("pack list"));
    }
    Ok(())
}
