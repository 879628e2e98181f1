use std::io;
use std::sync::Arc;

use crate::branch::{Branch, TableState};
use crate::error::{Result, UnionError};
use crate::inode::ObjectTable;
use crate::path;
use crate::resolve::{self, ResolvedPath};
use crate::storage::{FileKind, Stat};
use crate::whiteout;

const COPY_CHUNK: usize = 64 * 1024;

/// A directory created on the target branch, remembered for rollback.
#[derive(Debug)]
pub struct CreatedDir {
    pub path: String,
    /// A whiteout for it had to be removed first; the directory was made
    /// opaque in its place.
    pub revealed: bool,
}

/// Make `dir` and each of its ancestors exist as directories on branch
/// `target`, copying metadata from their visible counterparts. Returns the
/// directories that had to be created, top first.
pub fn ensure_dirs(
    table: &TableState,
    objects: &ObjectTable,
    target: usize,
    dir: &str,
) -> Result<Vec<CreatedDir>> {
    let branch = table.get(target);
    let mut created = Vec::new();
    let mut cur = path::ROOT.to_string();

    for component in path::components(dir) {
        let parent = cur.clone();
        cur = path::child(&parent, component);

        match branch.storage.stat(&cur) {
            Ok(Some(st)) if st.kind == FileKind::Directory => continue,
            Ok(Some(_)) => {
                rollback_dirs(objects, branch, &created);
                return Err(UnionError::CopyFailed {
                    path: cur,
                    source: io::Error::from_raw_os_error(libc::ENOTDIR),
                });
            }
            Ok(None) => {}
            Err(e) => {
                rollback_dirs(objects, branch, &created);
                return Err(e.into());
            }
        }

        match create_dir(table, objects, branch, &parent, component, &cur) {
            Ok(Some(dir)) => created.push(dir),
            Ok(None) => {}
            Err(e) => {
                rollback_dirs(objects, branch, &created);
                return Err(e);
            }
        }
    }

    for dir in &created {
        objects.invalidate(&dir.path);
    }
    Ok(created)
}

fn create_dir(
    table: &TableState,
    objects: &ObjectTable,
    branch: &Branch,
    parent: &str,
    name: &str,
    dir: &str,
) -> Result<Option<CreatedDir>> {
    let visible = resolve::resolve(table, objects, dir)?;
    let src = table
        .get(visible.effective)
        .storage
        .stat(dir)?
        .ok_or_else(|| UnionError::NotFound(dir.to_string()))?;

    let revealed = whiteout::reveal(branch, parent, name)?;
    let staging = path::child(parent, &whiteout::internal_name("cpup"));

    let built = (|| -> io::Result<()> {
        branch.storage.mkdir(&staging, 0o700)?;
        if revealed {
            // Lower copies were hidden by the whiteout; keep them hidden.
            branch
                .storage
                .create(&path::child(&staging, whiteout::OPAQUE_MARKER), 0o444)?;
        }
        branch.storage.copy_metadata(&src, &staging)?;
        branch.storage.rename(&staging, dir)
    })();

    match built {
        Ok(()) => {
            log::debug!("created ancestor {} on branch {}", dir, branch.id);
            Ok(Some(CreatedDir {
                path: dir.to_string(),
                revealed,
            }))
        }
        Err(e) => {
            discard_staging(branch, &staging);
            // Another copy-up may have won the race for the same directory.
            if let Ok(Some(st)) = branch.storage.stat(dir) {
                if st.kind == FileKind::Directory {
                    return Ok(None);
                }
            }
            if revealed {
                restore_whiteout(branch, parent, name);
            }
            Err(UnionError::CopyFailed {
                path: dir.to_string(),
                source: e,
            })
        }
    }
}

/// Undo `ensure_dirs`. Best effort: failures are logged.
pub fn rollback_dirs(objects: &ObjectTable, branch: &Branch, created: &[CreatedDir]) {
    for dir in created.iter().rev() {
        objects.invalidate(&dir.path);
        let removed = whiteout::purge_markers(branch, &dir.path)
            .and_then(|_| branch.storage.rmdir(&dir.path));
        if let Err(e) = removed {
            log::warn!(
                "rollback: could not remove {} on branch {}: {}",
                dir.path,
                branch.id,
                e
            );
            continue;
        }
        if dir.revealed {
            if let Some((parent, name)) = path::split(&dir.path) {
                restore_whiteout(branch, parent, name);
            }
        }
    }
}

fn restore_whiteout(branch: &Branch, parent: &str, name: &str) {
    if let Err(e) = whiteout::mark_deleted(branch, parent, name) {
        log::warn!(
            "rollback: could not restore whiteout of {} on branch {}: {}",
            path::child(parent, name),
            branch.id,
            e
        );
    }
}

pub(crate) fn discard_staging(branch: &Branch, staging: &str) {
    let result = match branch.storage.stat(staging) {
        Ok(Some(st)) if st.kind == FileKind::Directory => {
            whiteout::purge_markers(branch, staging).and_then(|_| branch.storage.rmdir(staging))
        }
        Ok(Some(_)) => branch.storage.unlink(staging),
        Ok(None) => Ok(()),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        log::warn!(
            "could not remove staging object {} on branch {}: {}",
            staging,
            branch.id,
            e
        );
    }
}

/// Copy the object `src` describes from `from` to the staging name on `to`.
/// `len` limits how much file data is copied.
fn build_copy(
    from: &Branch,
    to: &Branch,
    logical: &str,
    src: &Stat,
    staging: &str,
    len: Option<u64>,
) -> io::Result<()> {
    match src.kind {
        FileKind::File => {
            to.storage.create(staging, 0o600)?;
            let limit = len.map_or(src.size, |l| l.min(src.size));
            let mut offset = 0u64;
            while offset < limit {
                let want = COPY_CHUNK.min((limit - offset) as usize);
                let chunk = from.storage.read_at(logical, offset, want)?;
                if chunk.is_empty() {
                    break;
                }
                to.storage.write_at(staging, offset, &chunk)?;
                offset += chunk.len() as u64;
            }
        }
        FileKind::Directory => to.storage.mkdir(staging, 0o700)?,
        FileKind::Symlink => {
            let target = from.storage.read_link(logical)?;
            to.storage.symlink(&target, staging)?;
        }
        FileKind::Other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "special files cannot be copied up",
            ))
        }
    }
    to.storage.copy_metadata(src, staging)
}

/// Move a finished staging object to its real name. Without an atomic
/// rename the object is linked in and the staging name unlinked; the caller
/// holds the parent directory exclusively, so nobody sees both names.
fn install(to: &Branch, staging: &str, real: &str, kind: FileKind) -> io::Result<()> {
    if to.storage.supports_atomic_rename() || kind == FileKind::Directory {
        return to.storage.rename(staging, real);
    }
    to.storage.link(staging, real)?;
    if let Err(e) = to.storage.unlink(staging) {
        log::warn!("staging name {} left behind: {}", staging, e);
    }
    Ok(())
}

/// Copy `resolved` up to branch `target` and return its fresh resolution.
/// The caller holds the parent directory of `resolved.path` exclusively.
pub fn copy_up(
    table: &TableState,
    objects: &ObjectTable,
    resolved: &ResolvedPath,
    target: usize,
    len: Option<u64>,
) -> Result<Arc<ResolvedPath>> {
    let logical = resolved.path.as_str();
    if target == resolved.effective {
        return resolve::resolve(table, objects, logical);
    }
    let (parent, _) = path::split(logical)
        .ok_or_else(|| UnionError::copy_up_failed(logical, UnionError::IsADirectory("/".into())))?;

    let from = table.get(resolved.effective);
    let to = table.get(target);
    log::debug!(
        "copy-up {} from branch {} to branch {}",
        logical,
        from.id,
        to.id
    );

    let created =
        ensure_dirs(table, objects, target, parent).map_err(|e| UnionError::copy_up_failed(logical, e))?;

    let staging = path::child(parent, &whiteout::internal_name("cpup"));
    let copied = from
        .storage
        .stat(logical)
        .and_then(|st| {
            st.ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
        })
        .and_then(|src| {
            build_copy(from, to, logical, &src, &staging, len)?;
            install(to, &staging, logical, src.kind)
        });

    if let Err(e) = copied {
        discard_staging(to, &staging);
        rollback_dirs(objects, to, &created);
        return Err(UnionError::copy_up_failed(
            logical,
            UnionError::CopyFailed {
                path: logical.to_string(),
                source: e,
            },
        ));
    }

    objects.invalidate(logical);
    resolve::resolve(table, objects, logical)
}
