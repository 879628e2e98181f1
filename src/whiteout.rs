use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::branch::Branch;
use crate::error::{Result, UnionError};
use crate::path;
use crate::storage::FileKind;

/// `.wh.<name>` hides `<name>` below its branch. Every name with this prefix
/// is reserved.
pub const WHITEOUT_PREFIX: &str = ".wh.";
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
const INTERNAL_PREFIX: &str = ".wh..wh.";

static INTERNAL_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker<'a> {
    /// Hides the named entry below this branch.
    Whiteout(&'a str),
    Opaque,
    /// Staging or temporary object; never shown and never meaningful.
    Internal,
}

pub fn is_reserved(name: &str) -> bool {
    name.starts_with(WHITEOUT_PREFIX)
}

pub fn classify(name: &str) -> Option<Marker<'_>> {
    if name == OPAQUE_MARKER {
        Some(Marker::Opaque)
    } else if name.starts_with(INTERNAL_PREFIX) {
        Some(Marker::Internal)
    } else {
        name.strip_prefix(WHITEOUT_PREFIX).map(Marker::Whiteout)
    }
}

pub fn whiteout_name(name: &str) -> String {
    format!("{}{}", WHITEOUT_PREFIX, name)
}

/// A fresh internal name for a staging (`cpup`, `mkdir`) or temporary
/// (`del`) object.
pub fn internal_name(tag: &str) -> String {
    let seq = INTERNAL_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}{}.{}-{:x}", INTERNAL_PREFIX, tag, std::process::id(), seq)
}

fn whiteout_path(parent: &str, name: &str) -> String {
    path::child(parent, &whiteout_name(name))
}

pub fn is_whited_out(branch: &Branch, parent: &str, name: &str) -> Result<bool> {
    Ok(branch
        .storage
        .stat(&whiteout_path(parent, name))?
        .is_some())
}

pub fn is_opaque(branch: &Branch, dir: &str) -> Result<bool> {
    Ok(branch
        .storage
        .stat(&path::child(dir, OPAQUE_MARKER))?
        .is_some())
}

fn require_writable(branch: &Branch, path: &str) -> Result<()> {
    if branch.permission.is_writable() {
        Ok(())
    } else {
        Err(UnionError::ReadOnly(path.to_string()))
    }
}

/// Hide `name` below `branch`. A live object of the same name in this branch
/// is removed first so marker and object never coexist.
pub fn mark_deleted(branch: &Branch, parent: &str, name: &str) -> Result<()> {
    let target = path::child(parent, name);
    require_writable(branch, &target)?;
    let failed = |source: io::Error| UnionError::DeleteFailed {
        path: target.clone(),
        source,
    };

    if let Some(stat) = branch.storage.stat(&target).map_err(failed)? {
        let removed = if stat.kind == FileKind::Directory {
            purge_markers(branch, &target).and_then(|_| branch.storage.rmdir(&target))
        } else {
            branch.storage.unlink(&target)
        };
        removed.map_err(failed)?;
    }

    match branch.storage.create(&whiteout_path(parent, name), 0o444) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(failed(e)),
    }
    log::debug!("whiteout {} on branch {}", target, branch.id);
    Ok(())
}

/// Hide every lower child of `dir`.
pub fn mark_opaque(branch: &Branch, dir: &str) -> Result<()> {
    require_writable(branch, dir)?;
    match branch.storage.create(&path::child(dir, OPAQUE_MARKER), 0o444) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => return Err(e.into()),
    }
    log::debug!("opaque {} on branch {}", dir, branch.id);
    Ok(())
}

/// Remove the whiteout for `name` at `branch`. Returns whether one existed.
pub fn reveal(branch: &Branch, parent: &str, name: &str) -> Result<bool> {
    require_writable(branch, &path::child(parent, name))?;
    match branch.storage.unlink(&whiteout_path(parent, name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Delete every marker inside `dir` so the directory can be removed.
/// Fails with `ENOTEMPTY` if a real entry is still present.
pub fn purge_markers(branch: &Branch, dir: &str) -> io::Result<()> {
    let entries = branch.storage.read_dir(dir)?;
    if entries.iter().any(|e| !is_reserved(&e.name)) {
        return Err(io::Error::from_raw_os_error(libc::ENOTEMPTY));
    }
    for entry in entries {
        let p = path::child(dir, &entry.name);
        if entry.kind == FileKind::Directory {
            // Leftover staging directory of an interrupted copy-up.
            purge_markers(branch, &p)?;
            branch.storage.rmdir(&p)?;
        } else {
            branch.storage.unlink(&p)?;
        }
    }
    Ok(())
}
