use std::collections::HashSet;

use crate::branch::TableState;
use crate::error::{Result, UnionError};
use crate::resolve::ResolvedPath;
use crate::storage::DirEntry;
use crate::whiteout::{self, Marker};

/// Merge the listings of every branch making up `dir`.
///
/// The first branch to mention a name decides it, either by listing the
/// entry or by whiting it out. Markers are never part of the result.
pub fn merge(table: &TableState, dir: &ResolvedPath) -> Result<Vec<DirEntry>> {
    if !dir.is_dir() {
        return Err(UnionError::NotADirectory(dir.path.clone()));
    }

    let mut decided: HashSet<String> = HashSet::new();
    let mut merged = Vec::new();

    for index in dir.dir_branches() {
        let entries = table.get(index).storage.read_dir(&dir.path)?;
        decided.reserve(entries.len());

        let mut opaque = false;
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            match whiteout::classify(&entry.name) {
                Some(Marker::Whiteout(name)) => {
                    decided.insert(name.to_string());
                }
                Some(Marker::Opaque) => opaque = true,
                Some(Marker::Internal) => {}
                None => live.push(entry),
            }
        }

        for entry in live {
            if decided.insert(entry.name.clone()) {
                merged.push(entry);
            }
        }

        if opaque {
            break;
        }
    }

    Ok(merged)
}

/// Whether `dir` shows no entries at all.
pub fn is_empty(table: &TableState, dir: &ResolvedPath) -> Result<bool> {
    Ok(merge(table, dir)?.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchTable, Permission};
    use crate::resolve::resolve_uncached;
    use crate::storage::{DiskStorage, Storage};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn stack(n: usize) -> (Vec<TempDir>, BranchTable) {
        let dirs: Vec<TempDir> = (0..n).map(|_| TempDir::new().unwrap()).collect();
        let initial = dirs
            .iter()
            .map(|d| {
                (
                    Arc::new(DiskStorage::open(d.path()).unwrap()) as Arc<dyn Storage>,
                    Permission::ReadOnly,
                )
            })
            .collect();
        (dirs, BranchTable::new(initial).unwrap())
    }

    fn names(table: &BranchTable, path: &str) -> Vec<String> {
        let state = table.read();
        let dir = resolve_uncached(&state, path).unwrap();
        let mut names: Vec<String> = merge(&state, &dir)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    #[test]
    fn whiteouts_hide_lower_entries_only() {
        let (dirs, table) = stack(2);
        fs::write(dirs[0].path().join(".wh.b"), b"").unwrap();
        fs::write(dirs[0].path().join("c"), b"").unwrap();
        fs::write(dirs[1].path().join("a"), b"").unwrap();
        fs::write(dirs[1].path().join("b"), b"").unwrap();

        assert_eq!(names(&table, "/"), vec!["a", "c"]);
    }

    #[test]
    fn staging_objects_are_invisible() {
        let (dirs, table) = stack(1);
        fs::write(dirs[0].path().join(whiteout::internal_name("cpup")), b"").unwrap();
        fs::write(dirs[0].path().join("real"), b"").unwrap();
        assert_eq!(names(&table, "/"), vec!["real"]);
    }

    #[test]
    fn first_branch_decides_entry_kind() {
        let (dirs, table) = stack(2);
        fs::create_dir(dirs[0].path().join("x")).unwrap();
        fs::write(dirs[1].path().join("x"), b"").unwrap();

        let state = table.read();
        let root = resolve_uncached(&state, "/").unwrap();
        let merged = merge(&state, &root).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].kind, crate::storage::FileKind::Directory);
    }

    #[test]
    fn listing_a_file_is_an_error() {
        let (dirs, table) = stack(1);
        fs::write(dirs[0].path().join("f"), b"").unwrap();
        let state = table.read();
        let f = resolve_uncached(&state, "/f").unwrap();
        assert!(matches!(
            merge(&state, &f).unwrap_err(),
            UnionError::NotADirectory(_)
        ));
    }
}
