//! SQLite file-list database
//!
//! Same content as a `met2` block plus the file names, in two tables:
//! - `files(path, pack_index)`: every file and the pack owning it
//! - `packs(name, dependency)`: every pack with its direct dependencies as
//!   a `", "`-separated list of pack indices
//!
//! Row order is significant: the n-th `packs` row is pack index n.
//! Such a database describes packs shipped with the application (the
//! manager's `local_packs_db`) and is also written next to the pack store
//! after every remote index load.

use rusqlite::{params, Connection, OpenFlags};
use std::path::Path;
use tracing::{debug, info};

use super::{parse_dependency_list, FileNamesTree, MetaError, PackDescription, PackMetaData};
use crate::graph::PackGraph;
use crate::paths::is_safe_relative;

/// A loaded file-list database.
#[derive(Debug, Clone)]
pub struct LocalPacksDb {
    meta: PackMetaData,
    names: Vec<String>,
    tree: FileNamesTree,
}

impl LocalPacksDb {
    /// Open and validate a database.
    pub fn open(db_path: &Path) -> Result<Self, MetaError> {
        if !db_path.is_file() {
            return Err(MetaError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no local packs database: {}", db_path.display()),
            )));
        }

        let conn = Connection::open_with_flags(db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let mut names = Vec::new();
        let mut file_packs = Vec::new();
        {
            let mut stmt = conn.prepare_cached("SELECT path, pack_index FROM files ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?)))?;
            for row in rows {
                let (path, pack) = row?;
                if !is_safe_relative(&path) {
                    return Err(MetaError::Malformed(format!("unsafe file name '{}'", path)));
                }
                names.push(path);
                file_packs.push(pack);
            }
        }

        let mut packs = Vec::new();
        {
            let mut stmt = conn.prepare_cached("SELECT name, dependency FROM packs ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
            for row in rows {
                let (name, dependency) = row?;
                packs.push(PackDescription {
                    name,
                    dependencies: parse_dependency_list(&dependency)?,
                });
            }
        }

        for (file, &index) in file_packs.iter().enumerate() {
            if index as usize >= packs.len() {
                return Err(MetaError::PackIndexOutOfRange {
                    file,
                    index,
                    packs: packs.len(),
                });
            }
        }
        PackGraph::from_dependencies(packs.iter().map(|p| p.dependencies.clone()).collect())?;

        info!(
            "Loaded local packs database {} ({} packs, {} files)",
            db_path.display(),
            packs.len(),
            names.len()
        );

        let tree = names.iter().map(String::as_str).collect();
        Ok(Self {
            meta: PackMetaData::new(packs, file_packs),
            names,
            tree,
        })
    }

    pub fn meta(&self) -> &PackMetaData {
        &self.meta
    }

    pub fn file_names(&self) -> &[String] {
        &self.names
    }

    pub fn contains_file(&self, relative_path: &str) -> bool {
        self.tree.contains(relative_path)
    }

    pub fn has_pack(&self, name: &str) -> bool {
        self.meta.has_pack(name)
    }
}

/// Write (replacing) a file-list database.
pub fn write_packs_db(db_path: &Path, meta: &PackMetaData, file_names: &[String]) -> Result<(), MetaError> {
    if file_names.len() != meta.file_count() {
        return Err(MetaError::Malformed(format!(
            "{} file names for {} files",
            file_names.len(),
            meta.file_count()
        )));
    }

    if db_path.exists() {
        std::fs::remove_file(db_path)?;
    }

    let mut conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = DELETE;
         CREATE TABLE IF NOT EXISTS files (
             path TEXT NOT NULL,
             pack_index INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS packs (
             name TEXT NOT NULL,
             dependency TEXT NOT NULL
         );",
    )?;

    let tx = conn.transaction()?;
    {
        let mut insert_file = tx.prepare_cached("INSERT INTO files (path, pack_index) VALUES (?1, ?2)")?;
        for (path, pack) in file_names.iter().zip(meta.file_pack_indexes()) {
            insert_file.execute(params![path, pack])?;
        }

        let mut insert_pack = tx.prepare_cached("INSERT INTO packs (name, dependency) VALUES (?1, ?2)")?;
        for pack in meta.packs() {
            let deps: Vec<String> = pack.dependencies.iter().map(|d| d.to_string()).collect();
            insert_pack.execute(params![pack.name, deps.join(", ")])?;
        }
    }
    tx.commit()?;

    debug!("Wrote packs database {}", db_path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> (PackMetaData, Vec<String>) {
        let meta = PackMetaData::new(
            vec![
                PackDescription { name: "base".into(), dependencies: vec![] },
                PackDescription { name: "ui".into(), dependencies: vec![0] },
            ],
            vec![0, 1, 1],
        );
        let names = vec!["data/base.txt".into(), "ui/font.fnt".into(), "ui/button.png".into()];
        (meta, names)
    }

    #[test]
    fn test_write_then_open() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("local_packs.db");
        let (meta, names) = sample();
        write_packs_db(&path, &meta, &names)?;
        // Overwrites cleanly
        write_packs_db(&path, &meta, &names)?;

        let db = LocalPacksDb::open(&path)?;
        assert_eq!(db.file_names(), names.as_slice());
        assert!(db.has_pack("ui"));
        assert_eq!(db.meta().pack(1).unwrap().dependencies, vec![0]);
        assert_eq!(db.meta().file_indexes(1), vec![1, 2]);
        assert!(db.contains_file("ui/font.fnt"));
        assert!(!db.contains_file("ui/missing.png"));
        Ok(())
    }

    #[test]
    fn test_missing_db_is_error() {
        assert!(LocalPacksDb::open(Path::new("/nonexistent/local.db")).is_err());
    }

    #[test]
    fn test_cyclic_db_is_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("cyclic.db");
        let meta = PackMetaData::new(
            vec![
                PackDescription { name: "a".into(), dependencies: vec![1] },
                PackDescription { name: "b".into(), dependencies: vec![0] },
            ],
            vec![0],
        );
        write_packs_db(&path, &meta, &["a.txt".to_string()])?;
        assert!(matches!(LocalPacksDb::open(&path), Err(MetaError::Graph(_))));
        Ok(())
    }

    #[test]
    fn test_escaping_names_are_rejected() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let (meta, _) = sample();
        for bad in ["../outside.txt", "/etc/passwd", "ui/../../outside.txt"] {
            let path = dir.path().join("escaping.db");
            let names = vec!["data/base.txt".to_string(), bad.to_string(), "ui/button.png".to_string()];
            write_packs_db(&path, &meta, &names)?;
            assert!(matches!(LocalPacksDb::open(&path), Err(MetaError::Malformed(_))), "{}", bad);
        }
        Ok(())
    }
}
