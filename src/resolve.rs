use std::sync::Arc;

use crate::branch::{BranchId, TableState};
use crate::error::{Result, UnionError};
use crate::inode::ObjectTable;
use crate::path;
use crate::storage::FileKind;
use crate::whiteout;

/// What one branch showed for a logical path. Branches below the point
/// where the scan stopped are left unprobed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    pub branch: BranchId,
    pub kind: Option<FileKind>,
    pub whiteout: bool,
    pub opaque: bool,
}

#[derive(Debug, Clone)]
pub struct ResolvedPath {
    pub path: String,
    /// One entry per branch, in table order.
    pub layers: Vec<Layer>,
    /// Order index of the branch that supplies the visible object.
    pub effective: usize,
    /// Lowest branch contributing to the object. Equals `effective` for
    /// anything but a directory.
    pub bottom: usize,
    pub kind: FileKind,
    /// Table generation this resolution belongs to.
    pub generation: u64,
}

impl ResolvedPath {
    pub fn effective_branch(&self) -> BranchId {
        self.layers[self.effective].branch
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// True if branch `index` holds a directory that is part of this merged
    /// directory.
    pub fn dir_at(&self, index: usize) -> bool {
        self.is_dir()
            && index >= self.effective
            && index <= self.bottom
            && self.layers[index].kind == Some(FileKind::Directory)
    }

    /// Order indices of the branches making up this directory, top first.
    pub fn dir_branches(&self) -> impl Iterator<Item = usize> + '_ {
        (self.effective..=self.bottom).filter(move |&i| self.dir_at(i))
    }

    /// Whether a branch other than `index` still shows this object.
    pub fn visible_elsewhere(&self, index: usize) -> bool {
        (self.effective..=self.bottom)
            .any(|i| i != index && self.layers[i].kind.is_some())
    }

    pub fn present_at(&self, index: usize) -> bool {
        index >= self.effective && index <= self.bottom && self.layers[index].kind.is_some()
    }
}

#[derive(Debug, Clone)]
pub enum Lookup {
    Found(ResolvedPath),
    /// Nothing visible. `whiteout_at` names the branch whose marker hid it.
    Negative { whiteout_at: Option<usize> },
}

fn empty_layers(table: &TableState) -> Vec<Layer> {
    table
        .iter()
        .map(|b| Layer {
            branch: b.id,
            kind: None,
            whiteout: false,
            opaque: false,
        })
        .collect()
}

pub fn resolve_root(table: &TableState) -> Result<ResolvedPath> {
    let mut layers = empty_layers(table);
    let mut bottom = 0;
    for (index, branch) in table.iter().enumerate() {
        match branch.storage.stat(path::ROOT)? {
            Some(st) if st.kind == FileKind::Directory => {}
            _ => {
                return Err(UnionError::Storage(std::io::Error::other(format!(
                    "root of branch {} is not a directory",
                    branch.id
                ))))
            }
        }
        layers[index].kind = Some(FileKind::Directory);
        bottom = index;
        if whiteout::is_opaque(branch, path::ROOT)? {
            layers[index].opaque = true;
            break;
        }
    }
    Ok(ResolvedPath {
        path: path::ROOT.to_string(),
        layers,
        effective: 0,
        bottom,
        kind: FileKind::Directory,
        generation: table.generation(),
    })
}

/// Resolve `name` inside the already resolved directory `parent`.
pub fn lookup_child(table: &TableState, parent: &ResolvedPath, name: &str) -> Result<Lookup> {
    if !parent.is_dir() {
        return Err(UnionError::NotADirectory(parent.path.clone()));
    }
    if whiteout::is_reserved(name) {
        return Ok(Lookup::Negative { whiteout_at: None });
    }

    let child = path::child(&parent.path, name);
    let mut layers = empty_layers(table);
    let mut found: Option<(usize, FileKind)> = None;
    let mut bottom = 0;

    for index in 0..table.len() {
        if !parent.dir_at(index) {
            continue;
        }
        let branch = table.get(index);

        if whiteout::is_whited_out(branch, &parent.path, name)? {
            layers[index].whiteout = true;
            if found.is_none() {
                return Ok(Lookup::Negative {
                    whiteout_at: Some(index),
                });
            }
            break;
        }

        let Some(st) = branch.storage.stat(&child)? else {
            continue;
        };
        layers[index].kind = Some(st.kind);

        match found {
            None => {
                found = Some((index, st.kind));
                bottom = index;
                if st.kind != FileKind::Directory {
                    break;
                }
            }
            Some(_) => {
                if st.kind != FileKind::Directory {
                    // A lower non-directory ends the merged directory.
                    break;
                }
                bottom = index;
            }
        }

        if whiteout::is_opaque(branch, &child)? {
            layers[index].opaque = true;
            break;
        }
    }

    Ok(match found {
        Some((effective, kind)) => Lookup::Found(ResolvedPath {
            path: child,
            layers,
            effective,
            bottom,
            kind,
            generation: table.generation(),
        }),
        None => Lookup::Negative { whiteout_at: None },
    })
}

/// Whether some branch below `index` would show `name` inside `parent` if
/// nothing at or above `index` hid it.
pub fn shown_below(
    table: &TableState,
    parent: &ResolvedPath,
    name: &str,
    index: usize,
) -> Result<bool> {
    let child = path::child(&parent.path, name);
    for i in (index + 1)..table.len() {
        if !parent.dir_at(i) {
            continue;
        }
        let branch = table.get(i);
        if whiteout::is_whited_out(branch, &parent.path, name)? {
            return Ok(false);
        }
        if branch.storage.stat(&child)?.is_some() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Resolve `path` component by component without touching any cache.
pub fn resolve_uncached(table: &TableState, logical: &str) -> Result<ResolvedPath> {
    let mut cur = resolve_root(table)?;
    for component in path::components(logical) {
        cur = match lookup_child(table, &cur, component)? {
            Lookup::Found(r) => r,
            Lookup::Negative { .. } => {
                return Err(UnionError::NotFound(path::child(&cur.path, component)))
            }
        };
    }
    Ok(cur)
}

/// Resolve `path`, reusing and filling the object cache.
pub fn resolve(
    table: &TableState,
    objects: &ObjectTable,
    logical: &str,
) -> Result<Arc<ResolvedPath>> {
    let generation = table.generation();
    if let Some(hit) = objects.cached(logical, generation) {
        return Ok(hit);
    }

    let token = objects.epoch();
    let mut cur = match objects.cached(path::ROOT, generation) {
        Some(root) => root,
        None => {
            let root = Arc::new(resolve_root(table)?);
            objects.store(root.clone(), token);
            root
        }
    };

    for component in path::components(logical) {
        let child = path::child(&cur.path, component);
        if !cur.is_dir() {
            return Err(UnionError::NotADirectory(cur.path.clone()));
        }
        if let Some(hit) = objects.cached(&child, generation) {
            cur = hit;
            continue;
        }
        cur = match lookup_child(table, &cur, component)? {
            Lookup::Found(r) => {
                let r = Arc::new(r);
                objects.store(r.clone(), token);
                r
            }
            Lookup::Negative { .. } => return Err(UnionError::NotFound(child)),
        };
    }
    Ok(cur)
}
