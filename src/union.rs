use std::io;
use std::path::Path;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use dashmap::DashMap;

use crate::branch::{Branch, BranchId, BranchInfo, BranchOp, BranchTable, Permission, TableState};
use crate::config::UnionConfig;
use crate::copyup::{self, CreatedDir};
use crate::error::{Result, UnionError};
use crate::handle::{HandleTracker, OpenReferences};
use crate::inode::ObjectTable;
use crate::lock::DirLocks;
use crate::path;
use crate::policy::{self, CopyUpPolicy, CreatePolicy};
use crate::readdir;
use crate::resolve::{self, Lookup, ResolvedPath};
use crate::storage::{DirEntry, DiskStorage, FileKind, Stat, Storage};
use crate::whiteout;

#[derive(Debug, Clone, Copy, Default)]
pub struct UnionOptions {
    pub copyup: CopyUpPolicy,
    pub create: CreatePolicy,
}

enum NewObject<'a> {
    File(u32),
    Dir(u32),
    Symlink(&'a Path),
}

/// Every operation holds the branch table's shared lock until it returns.
pub struct Union {
    table: BranchTable,
    objects: ObjectTable,
    locks: DirLocks,
    handles: HandleTracker,
    options: UnionOptions,
    /// Per-directory create target overrides, keyed by logical directory.
    write_targets: DashMap<String, BranchId>,
    rotor: AtomicUsize,
}

impl Union {
    pub fn new(branches: Vec<(Arc<dyn Storage>, Permission)>, options: UnionOptions) -> Result<Self> {
        let table = BranchTable::new(branches)?;
        log::info!(
            "union ready with {} branches (copy-up {:?}, create {:?})",
            table.read().len(),
            options.copyup,
            options.create
        );
        Ok(Self {
            table,
            objects: ObjectTable::new(),
            locks: DirLocks::new(),
            handles: HandleTracker::new(),
            options,
            write_targets: DashMap::new(),
            rotor: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &UnionConfig) -> Result<Self> {
        let mut branches = Vec::new();
        for (dir, permission) in config.branch_list()? {
            let storage = DiskStorage::open(&dir)
                .map_err(|e| UnionError::Config(format!("branch {}: {}", dir.display(), e)))?;
            branches.push((Arc::new(storage) as Arc<dyn Storage>, permission));
        }
        Self::new(
            branches,
            UnionOptions {
                copyup: config.copyup,
                create: config.create,
            },
        )
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn handles(&self) -> &HandleTracker {
        &self.handles
    }

    pub fn branches(&self) -> Vec<BranchInfo> {
        self.table.read().info()
    }

    // Resolution

    fn lookup_in(&self, table: &TableState, path: &str) -> Result<Arc<ResolvedPath>> {
        match path::split(path) {
            None => resolve::resolve(table, &self.objects, path),
            Some((parent, _)) => self
                .locks
                .shared(parent, || resolve::resolve(table, &self.objects, path)),
        }
    }

    /// Resolve a logical path to its visible object.
    pub fn resolve(&self, logical: &str) -> Result<Arc<ResolvedPath>> {
        let path = path::normalize(logical);
        let table = self.table.read();
        self.lookup_in(&table, &path)
    }

    /// Attributes of the visible object.
    pub fn stat(&self, logical: &str) -> Result<(Arc<ResolvedPath>, Stat)> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let resolved = self.lookup_in(&table, &path)?;
        let stat = table
            .get(resolved.effective)
            .storage
            .stat(&path)?
            .ok_or_else(|| UnionError::NotFound(path.clone()))?;
        Ok((resolved, stat))
    }

    pub fn list_directory(&self, logical: &str) -> Result<Vec<DirEntry>> {
        let path = path::normalize(logical);
        let table = self.table.read();
        self.locks.shared(&path, || {
            let dir = resolve::resolve(&table, &self.objects, &path)?;
            if !dir.is_dir() {
                return Err(UnionError::NotADirectory(path.clone()));
            }
            readdir::merge(&table, &dir)
        })
    }

    pub fn read(&self, logical: &str, offset: u64, size: usize) -> Result<Vec<u8>> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let resolved = self.lookup_in(&table, &path)?;
        if resolved.is_dir() {
            return Err(UnionError::IsADirectory(path));
        }
        Ok(table
            .get(resolved.effective)
            .storage
            .read_at(&path, offset, size)?)
    }

    pub fn read_link(&self, logical: &str) -> Result<std::path::PathBuf> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let resolved = self.lookup_in(&table, &path)?;
        if resolved.kind != FileKind::Symlink {
            return Err(io::Error::from_raw_os_error(libc::EINVAL).into());
        }
        Ok(table.get(resolved.effective).storage.read_link(&path)?)
    }

    // Writes to existing objects

    /// Make `path` live on a writable branch, copying it up if needed, and
    /// return that branch's order index. `len` limits the file data copied.
    fn ensure_writable_in(&self, table: &TableState, path: &str, len: Option<u64>) -> Result<usize> {
        let Some((parent, _)) = path::split(path) else {
            let root = resolve::resolve(table, &self.objects, path)?;
            return policy::copyup_target(self.options.copyup, table, &root);
        };
        self.locks.exclusive(parent, || {
            let resolved = resolve::resolve(table, &self.objects, path)?;
            let target = policy::copyup_target(self.options.copyup, table, &resolved)?;
            if target != resolved.effective {
                copyup::copy_up(table, &self.objects, &resolved, target, len)?;
            }
            Ok(target)
        })
    }

    /// Make the object at `logical` writable and return the branch it now
    /// lives on.
    pub fn ensure_writable(&self, logical: &str) -> Result<BranchId> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let index = self.ensure_writable_in(&table, &path, None)?;
        Ok(table.get(index).id)
    }

    pub fn write(&self, logical: &str, offset: u64, data: &[u8]) -> Result<usize> {
        let path = path::normalize(logical);
        let table = self.table.read();
        if self.lookup_in(&table, &path)?.is_dir() {
            return Err(UnionError::IsADirectory(path));
        }
        let index = self.ensure_writable_in(&table, &path, None)?;
        Ok(table.get(index).storage.write_at(&path, offset, data)?)
    }

    /// Truncate or extend a file. Only the bytes that survive are copied up.
    pub fn truncate(&self, logical: &str, size: u64) -> Result<()> {
        let path = path::normalize(logical);
        let table = self.table.read();
        if self.lookup_in(&table, &path)?.is_dir() {
            return Err(UnionError::IsADirectory(path));
        }
        let index = self.ensure_writable_in(&table, &path, Some(size))?;
        Ok(table.get(index).storage.truncate(&path, size)?)
    }

    pub fn set_mode(&self, logical: &str, mode: u32) -> Result<()> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let index = self.ensure_writable_in(&table, &path, None)?;
        Ok(table.get(index).storage.set_mode(&path, mode)?)
    }

    // New objects

    pub fn create(&self, logical: &str, mode: u32) -> Result<Arc<ResolvedPath>> {
        self.create_object(logical, NewObject::File(mode))
    }

    pub fn mkdir(&self, logical: &str, mode: u32) -> Result<Arc<ResolvedPath>> {
        self.create_object(logical, NewObject::Dir(mode))
    }

    pub fn symlink(&self, target: &Path, logical: &str) -> Result<Arc<ResolvedPath>> {
        self.create_object(logical, NewObject::Symlink(target))
    }

    fn create_object(&self, logical: &str, new: NewObject<'_>) -> Result<Arc<ResolvedPath>> {
        if ends_in_dot_component(logical) {
            return Err(UnionError::InvalidName(logical.to_string()));
        }
        let path = path::normalize(logical);
        let (parent, name) = path::split(&path).ok_or_else(|| UnionError::Exists(path.clone()))?;
        validate_name(name)?;
        let table = self.table.read();

        self.locks.exclusive(parent, || {
            let parent_dir = resolve::resolve(&table, &self.objects, parent)?;
            let whiteout_at = match resolve::lookup_child(&table, &parent_dir, name)? {
                Lookup::Found(_) => return Err(UnionError::Exists(path.clone())),
                Lookup::Negative { whiteout_at } => whiteout_at,
            };
            let target = policy::create_target(
                self.options.create,
                &table,
                &parent_dir,
                whiteout_at,
                self.write_target_for(parent),
                &self.rotor,
            )?;

            let created = copyup::ensure_dirs(&table, &self.objects, target, parent)
                .map_err(|e| UnionError::copy_up_failed(parent, e))?;
            let branch = table.get(target);
            let over = Hidden {
                here: whiteout_at == Some(target),
                below: whiteout_at.is_some(),
            };
            if let Err(e) = place_new(branch, parent, name, &path, &new, over) {
                copyup::rollback_dirs(&self.objects, branch, &created);
                return Err(e);
            }
            log::debug!("created {} on branch {}", path, branch.id);

            self.objects.invalidate(&path);
            resolve::resolve(&table, &self.objects, &path)
        })
    }

    // Namespace changes

    /// Remove the object at `logical` from the union view. Lower copies that
    /// cannot be removed are hidden by a whiteout.
    pub fn delete(&self, logical: &str) -> Result<()> {
        let path = path::normalize(logical);
        let (parent, name) = path::split(&path).ok_or_else(|| UnionError::InvalidName(path.clone()))?;
        let table = self.table.read();

        self.locks.exclusive(parent, || {
            let parent_dir = resolve::resolve(&table, &self.objects, parent)?;
            let resolved = match resolve::lookup_child(&table, &parent_dir, name)? {
                Lookup::Found(r) => r,
                Lookup::Negative { .. } => return Err(UnionError::NotFound(path.clone())),
            };
            if resolved.is_dir() && !readdir::is_empty(&table, &resolved)? {
                return Err(UnionError::NotEmpty(path.clone()));
            }

            let w = if table.get(resolved.effective).accepts_writes() {
                resolved.effective
            } else {
                policy::copyup_target(self.options.copyup, &table, &resolved)?
            };
            let branch = table.get(w);
            let hide = resolve::shown_below(&table, &parent_dir, name, w)?;

            if resolved.effective == w {
                remove_physical(branch, parent, name, &path, resolved.kind, hide)?;
            } else {
                let created = copyup::ensure_dirs(&table, &self.objects, w, parent)
                    .map_err(|e| UnionError::copy_up_failed(parent, e))?;
                if let Err(e) = whiteout::mark_deleted(branch, parent, name) {
                    copyup::rollback_dirs(&self.objects, branch, &created);
                    return Err(e);
                }
            }
            log::debug!("deleted {} (whiteout: {})", path, hide || resolved.effective != w);

            self.objects.forget(&path);
            Ok(())
        })
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::normalize(from);
        let to = path::normalize(to);
        if from == to {
            return Ok(());
        }
        let (src_parent, src_name) =
            path::split(&from).ok_or_else(|| UnionError::InvalidName(from.clone()))?;
        let (dst_parent, dst_name) =
            path::split(&to).ok_or_else(|| UnionError::InvalidName(to.clone()))?;
        validate_name(dst_name)?;
        if path::is_within(&to, &from) {
            return Err(UnionError::InvalidName(to));
        }
        let table = self.table.read();

        self.locks.exclusive_pair(src_parent, dst_parent, || {
            let src_dir = resolve::resolve(&table, &self.objects, src_parent)?;
            let src = match resolve::lookup_child(&table, &src_dir, src_name)? {
                Lookup::Found(r) => r,
                Lookup::Negative { .. } => return Err(UnionError::NotFound(from.clone())),
            };
            let dst_dir = resolve::resolve(&table, &self.objects, dst_parent)?;
            let (dst, whiteout_at) = match resolve::lookup_child(&table, &dst_dir, dst_name)? {
                Lookup::Found(r) => (Some(r), None),
                Lookup::Negative { whiteout_at } => (None, whiteout_at),
            };

            if let Some(dst) = &dst {
                match (src.is_dir(), dst.is_dir()) {
                    (true, false) => return Err(UnionError::NotADirectory(to.clone())),
                    (false, true) => return Err(UnionError::IsADirectory(to.clone())),
                    (true, true) if !readdir::is_empty(&table, dst)? => {
                        return Err(UnionError::NotEmpty(to.clone()))
                    }
                    _ => {}
                }
            }

            let w = policy::copyup_target(self.options.copyup, &table, &src)?;
            if src.is_dir() && (w != src.effective || src.dir_branches().count() > 1) {
                return Err(UnionError::CrossDevice(from.clone()));
            }
            // The new name must be visible once it lands on `w`.
            let shadowed = dst.as_ref().is_some_and(|d| d.effective < w)
                || whiteout_at.is_some_and(|k| k < w)
                || w > dst_dir.bottom;
            if shadowed {
                return Err(UnionError::ReadOnly(to.clone()));
            }

            let src = if w != src.effective {
                copyup::copy_up(&table, &self.objects, &src, w, None)?
            } else {
                Arc::new(src)
            };
            let branch = table.get(w);
            let dst_below = resolve::shown_below(&table, &dst_dir, dst_name, w)?;
            let src_below = resolve::shown_below(&table, &src_dir, src_name, w)?;
            let needs_opaque = src.is_dir() && dst_below && !whiteout::is_opaque(branch, &from)?;
            let replaced = dst.as_ref().filter(|d| d.effective == w).map(|d| d.kind);

            let created = copyup::ensure_dirs(&table, &self.objects, w, dst_parent)
                .map_err(|e| UnionError::copy_up_failed(dst_parent, e))?;
            let mut steps = RenameSteps {
                branch,
                objects: &self.objects,
                created,
                revealed: None,
                opaque: None,
                aside: None,
            };
            let failed = |source: io::Error| UnionError::RenameFailed {
                path: to.clone(),
                source,
            };

            match reveal_if(branch, dst_parent, dst_name, whiteout_at == Some(w)) {
                Ok(true) => steps.revealed = Some((dst_parent, dst_name)),
                Ok(false) => {}
                Err(e) => {
                    steps.undo();
                    return Err(e);
                }
            }
            // A directory landing on a name that lower branches still show
            // is made opaque while it sits under its old name.
            if needs_opaque {
                let marker = path::child(&from, whiteout::OPAQUE_MARKER);
                if let Err(e) = branch.storage.create(&marker, 0o444) {
                    steps.undo();
                    return Err(failed(e));
                }
                steps.opaque = Some(marker);
            }
            if replaced.is_some() {
                let aside = path::child(dst_parent, &whiteout::internal_name("del"));
                if let Err(e) = branch.storage.rename(&to, &aside) {
                    steps.undo();
                    return Err(failed(e));
                }
                steps.aside = Some((aside, to.as_str()));
            }
            if let Err(e) = branch.storage.rename(&from, &to) {
                steps.undo();
                return Err(failed(e));
            }
            if src_below {
                if let Err(e) = whiteout::mark_deleted(branch, src_parent, src_name) {
                    if let Err(back) = branch.storage.rename(&to, &from) {
                        log::warn!("could not move {} back to {}: {}", to, from, back);
                    }
                    steps.undo();
                    return Err(e);
                }
            }
            if let (Some((aside, _)), Some(kind)) = (&steps.aside, replaced) {
                if let Err(e) = remove_object(branch, aside, kind) {
                    log::warn!(
                        "renamed {} over {} but {} was left on branch {}: {}",
                        from,
                        to,
                        aside,
                        branch.id,
                        e
                    );
                }
            }
            log::debug!("renamed {} to {} on branch {}", from, to, branch.id);

            self.objects.rename(&from, &to);
            self.objects.invalidate(src_parent);
            self.objects.invalidate(dst_parent);
            self.handles.rename_prefix(&from, &to);
            Ok(())
        })
    }

    // Handles

    /// Open `logical`, copying it up first when opened for writing. Returns
    /// a handle number pinned to the branch that serves it.
    pub fn open(&self, logical: &str, write: bool) -> Result<u64> {
        let path = path::normalize(logical);
        let table = self.table.read();
        let index = if write {
            self.ensure_writable_in(&table, &path, None)?
        } else {
            self.lookup_in(&table, &path)?.effective
        };
        Ok(self.handles.register(&path, table.get(index).id, write))
    }

    /// Release a handle. The last handle on a branch awaiting removal
    /// completes that removal.
    pub fn release(&self, fh: u64) {
        let Some(handle) = self.handles.release(fh) else {
            return;
        };
        if self.handles.has_refs(handle.branch) {
            return;
        }
        if self.table.reap(handle.branch, &self.handles).is_some() {
            self.objects.invalidate_all();
            self.drop_write_targets(handle.branch);
        }
    }

    // Configuration

    /// Apply a branch reconfiguration and drop every cached resolution.
    pub fn reconfigure_branches(&self, op: BranchOp) -> Result<()> {
        let removed = self.table.apply(op, &self.handles)?;
        self.objects.invalidate_all();
        if let Some(branch) = removed {
            self.drop_write_targets(branch.id);
        }
        Ok(())
    }

    /// Add a directory as a new branch at `position`.
    pub fn add_branch(&self, dir: &Path, permission: Permission, position: usize) -> Result<()> {
        let storage = DiskStorage::open(dir)
            .map_err(|e| UnionError::Config(format!("branch {}: {}", dir.display(), e)))?;
        self.reconfigure_branches(BranchOp::Add {
            storage: Arc::new(storage),
            permission,
            position,
        })
    }

    /// Route new objects below `dir` to branch `id` regardless of the create
    /// policy, as long as that branch can hold them.
    pub fn set_write_target(&self, dir: &str, id: BranchId) -> Result<()> {
        let dir = path::normalize(dir);
        let table = self.table.read();
        let index = table.index_of(id).ok_or(UnionError::UnknownBranch(id.0))?;
        if !table.get(index).accepts_writes() {
            return Err(UnionError::ReadOnly(dir));
        }
        if !self.lookup_in(&table, &dir)?.is_dir() {
            return Err(UnionError::NotADirectory(dir));
        }
        log::info!("write target for {} is branch {}", dir, id);
        self.write_targets.insert(dir, id);
        Ok(())
    }

    pub fn clear_write_target(&self, dir: &str) -> bool {
        self.write_targets.remove(&path::normalize(dir)).is_some()
    }

    fn write_target_for(&self, dir: &str) -> Option<BranchId> {
        let mut cur = dir;
        loop {
            if let Some(id) = self.write_targets.get(cur) {
                return Some(*id);
            }
            cur = path::split(cur)?.0;
        }
    }

    fn drop_write_targets(&self, id: BranchId) {
        self.write_targets.retain(|_, target| *target != id);
    }

    /// Wait for in-flight operations and stop. Fails while handles are open.
    pub fn shutdown(&self) -> Result<Vec<BranchInfo>> {
        if let Some(branch) = self.handles.any_pinned_branch() {
            return Err(UnionError::Busy(branch.0));
        }
        let branches = self.table.drain();
        self.objects.invalidate_all();
        log::info!("union shut down ({} branches)", branches.len());
        Ok(branches)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\0')
        || whiteout::is_reserved(name)
    {
        return Err(UnionError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// `.` or `..` as the last component, which normalizing would fold away.
fn ends_in_dot_component(logical: &str) -> bool {
    matches!(
        logical.trim_end_matches('/').rsplit('/').next(),
        Some(".") | Some("..")
    )
}

fn reveal_if(branch: &Branch, parent: &str, name: &str, present: bool) -> Result<bool> {
    if present {
        whiteout::reveal(branch, parent, name)
    } else {
        Ok(false)
    }
}

/// Where a whiteout hid the name a new object is placed under.
#[derive(Debug, Clone, Copy)]
struct Hidden {
    /// On the target branch itself; it is removed first.
    here: bool,
    /// Anywhere from the target branch down.
    below: bool,
}

/// Build a new object on `branch`. A directory replacing a whited-out name
/// is made opaque before it gets its real name.
fn place_new(
    branch: &Branch,
    parent: &str,
    name: &str,
    path: &str,
    new: &NewObject<'_>,
    over: Hidden,
) -> Result<()> {
    let revealed = reveal_if(branch, parent, name, over.here)?;
    let made = match new {
        NewObject::File(mode) => branch.storage.create(path, *mode),
        NewObject::Symlink(target) => branch.storage.symlink(target, path),
        NewObject::Dir(mode) if over.below => {
            let staging = path::child(parent, &whiteout::internal_name("mkdir"));
            let built = branch
                .storage
                .mkdir(&staging, *mode)
                .and_then(|_| {
                    branch
                        .storage
                        .create(&path::child(&staging, whiteout::OPAQUE_MARKER), 0o444)
                })
                .and_then(|_| branch.storage.rename(&staging, path));
            if built.is_err() {
                copyup::discard_staging(branch, &staging);
            }
            built
        }
        NewObject::Dir(mode) => branch.storage.mkdir(path, *mode),
    };

    if let Err(e) = made {
        if revealed {
            if let Err(restore) = whiteout::mark_deleted(branch, parent, name) {
                log::warn!("could not restore whiteout of {}: {}", path, restore);
            }
        }
        return Err(e.into());
    }
    Ok(())
}

/// Changes a rename has made on its branch so far, reverted newest first.
struct RenameSteps<'a> {
    branch: &'a Branch,
    objects: &'a ObjectTable,
    created: Vec<CreatedDir>,
    revealed: Option<(&'a str, &'a str)>,
    opaque: Option<String>,
    /// Replaced destination, moved to an internal name until the rename is done.
    aside: Option<(String, &'a str)>,
}

impl RenameSteps<'_> {
    fn undo(self) {
        let branch = self.branch;
        if let Some((aside, to)) = &self.aside {
            if let Err(e) = branch.storage.rename(aside, to) {
                log::warn!("could not restore {} on branch {}: {}", to, branch.id, e);
            }
        }
        if let Some(marker) = &self.opaque {
            if let Err(e) = branch.storage.unlink(marker) {
                log::warn!("could not remove {} on branch {}: {}", marker, branch.id, e);
            }
        }
        if let Some((parent, name)) = self.revealed {
            if let Err(e) = whiteout::mark_deleted(branch, parent, name) {
                log::warn!(
                    "could not restore whiteout of {}: {}",
                    path::child(parent, name),
                    e
                );
            }
        }
        copyup::rollback_dirs(self.objects, branch, &self.created);
    }
}

fn remove_object(branch: &Branch, path: &str, kind: FileKind) -> io::Result<()> {
    if kind == FileKind::Directory {
        whiteout::purge_markers(branch, path)?;
        branch.storage.rmdir(path)
    } else {
        branch.storage.unlink(path)
    }
}

/// Remove an object that lives on `branch`. When lower branches still show
/// the name, the object is first moved aside so the whiteout can be created
/// before the data goes away.
fn remove_physical(
    branch: &Branch,
    parent: &str,
    name: &str,
    path: &str,
    kind: FileKind,
    hide: bool,
) -> Result<()> {
    let failed = |source: io::Error| UnionError::DeleteFailed {
        path: path.to_string(),
        source,
    };
    if !hide {
        return remove_object(branch, path, kind).map_err(failed);
    }

    let aside = path::child(parent, &whiteout::internal_name("del"));
    branch.storage.rename(path, &aside).map_err(failed)?;
    if let Err(e) = whiteout::mark_deleted(branch, parent, name) {
        if let Err(back) = branch.storage.rename(&aside, path) {
            log::warn!("could not restore {} on branch {}: {}", path, branch.id, back);
        }
        return Err(e);
    }
    if let Err(e) = remove_object(branch, &aside, kind) {
        log::warn!(
            "deleted {} but {} was left on branch {}: {}",
            path,
            aside,
            branch.id,
            e
        );
    }
    Ok(())
}
