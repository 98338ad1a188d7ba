//! Resource path handling for pack lookups
//!
//! Pack file tables store forward-slash relative paths such as
//! `3d/Maps/map.sc2`. Callers may refer to the same file as:
//! - a bare relative name (`3d/Maps/map.sc2`)
//! - a resource-scheme path (`~res:/3d/Maps/map.sc2`)
//! - an absolute path under the resource root or the pack store
//!
//! All three resolve to the same lookup key.

use std::path::{Component, Path, PathBuf};

/// Prefix of resource-scheme paths.
pub const RESOURCE_SCHEME: &str = "~res:/";

/// Extension of a single compressed file in the local pack store.
pub const STORE_EXT: &str = ".dvpl";

/// Extension of a partially downloaded store file.
pub const PART_EXT: &str = ".dvpl.part";

/// Normalize a relative path for lookups (forward slashes, no leading `./` or `/`).
///
/// Case is preserved: pack tables are case sensitive.
pub fn normalize_for_lookup(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut rest = unified.as_str();
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else {
            break;
        }
    }
    rest.trim_end_matches('/').to_string()
}

/// Resolve any accepted spelling of a resource path to its relative lookup key.
///
/// Absolute paths are resolved against each of `roots` in order; a path
/// under none of them yields `None`. A trailing store extension is
/// stripped so a path into the pack store maps back to its resource.
pub fn resource_relative(path: &str, roots: &[&Path]) -> Option<String> {
    if let Some(rest) = path.strip_prefix(RESOURCE_SCHEME) {
        return non_empty(normalize_for_lookup(rest));
    }

    let as_path = Path::new(path);
    if as_path.is_absolute() {
        let cleaned = clean_absolute(as_path);
        for root in roots {
            let root = clean_absolute(root);
            if let Ok(rel) = cleaned.strip_prefix(&root) {
                let rel = rel.to_string_lossy();
                let rel = rel.strip_suffix(STORE_EXT).unwrap_or(&rel);
                return non_empty(normalize_for_lookup(rel));
            }
        }
        return None;
    }

    non_empty(normalize_for_lookup(path))
}

/// Location of a finished file in the local pack store.
pub fn store_path(store_dir: &Path, relative: &str) -> PathBuf {
    store_dir.join(format!("{}{}", relative, STORE_EXT))
}

/// Location of a partially downloaded file in the local pack store.
pub fn part_path(store_dir: &Path, relative: &str) -> PathBuf {
    store_dir.join(format!("{}{}", relative, PART_EXT))
}

/// Create parent directories for a path if they don't exist
pub fn ensure_parent_dirs(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Whether a stored file name stays inside the directory it is joined to.
///
/// Names are forward-slash relative paths made of plain components only:
/// no `..` or `.`, no root, no drive prefix, no backslashes and no empty
/// segments.
pub fn is_safe_relative(name: &str) -> bool {
    if name.is_empty() || name.contains('\\') || name.contains('\0') {
        return false;
    }
    name.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && !segment.contains(':')
            && matches!(Path::new(segment).components().next(), Some(Component::Normal(_)))
    })
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Lexically drop `.` and resolve `..` components without touching the disk.
fn clean_absolute(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
