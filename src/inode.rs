use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::path;
use crate::resolve::ResolvedPath;

pub const ROOT_INO: u64 = 1;

#[derive(Debug, Clone)]
pub struct AufsObject {
    pub ino: u64,
    pub path: String,
    resolved: Option<Arc<ResolvedPath>>,
}

struct Objects {
    path_to_ino: HashMap<String, u64>,
    by_ino: HashMap<u64, AufsObject>,
    /// Bumped by every invalidation. A resolution computed under an older
    /// epoch may describe a namespace that no longer exists and is not
    /// stored.
    epoch: u64,
}

impl Objects {
    fn insert_path(&mut self, ino: u64, path: &str) {
        self.path_to_ino.insert(path.to_string(), ino);
        self.by_ino.insert(
            ino,
            AufsObject {
                ino,
                path: path.to_string(),
                resolved: None,
            },
        );
    }
}

/// Stable inode numbers per logical path, each with a slot for its cached
/// resolution. Resolutions are dropped wholesale on reconfiguration and per
/// subtree on namespace changes.
pub struct ObjectTable {
    next_ino: AtomicU64,
    inner: RwLock<Objects>,
}

impl ObjectTable {
    pub fn new() -> Self {
        let mut objects = Objects {
            path_to_ino: HashMap::new(),
            by_ino: HashMap::new(),
            epoch: 0,
        };
        objects.insert_path(ROOT_INO, path::ROOT);
        Self {
            next_ino: AtomicU64::new(ROOT_INO + 1),
            inner: RwLock::new(objects),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    /// Cached resolution of `path` if it belongs to `generation`.
    pub fn cached(&self, path: &str, generation: u64) -> Option<Arc<ResolvedPath>> {
        let inner = self.inner.read();
        let ino = inner.path_to_ino.get(path)?;
        inner
            .by_ino
            .get(ino)?
            .resolved
            .as_ref()
            .filter(|r| r.generation == generation)
            .cloned()
    }

    /// Record a resolution computed while the epoch was `token`. Returns the
    /// object's inode number either way.
    pub fn store(&self, resolved: Arc<ResolvedPath>, token: u64) -> u64 {
        let mut inner = self.inner.write();
        let ino = match inner.path_to_ino.get(&resolved.path) {
            Some(&ino) => ino,
            None => {
                let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
                inner.insert_path(ino, &resolved.path);
                ino
            }
        };
        if inner.epoch == token {
            if let Some(obj) = inner.by_ino.get_mut(&ino) {
                obj.resolved = Some(resolved);
            }
        } else {
            log::debug!("not caching stale resolution of {}", resolved.path);
        }
        ino
    }

    pub fn get_or_create(&self, path: &str) -> u64 {
        if let Some(&ino) = self.inner.read().path_to_ino.get(path) {
            return ino;
        }
        let mut inner = self.inner.write();
        if let Some(&ino) = inner.path_to_ino.get(path) {
            return ino;
        }
        let ino = self.next_ino.fetch_add(1, Ordering::SeqCst);
        inner.insert_path(ino, path);
        ino
    }

    pub fn get_ino(&self, path: &str) -> Option<u64> {
        self.inner.read().path_to_ino.get(path).copied()
    }

    pub fn get_path(&self, ino: u64) -> Option<String> {
        self.inner.read().by_ino.get(&ino).map(|o| o.path.clone())
    }

    pub fn get(&self, ino: u64) -> Option<AufsObject> {
        self.inner.read().by_ino.get(&ino).cloned()
    }

    /// Drop cached resolutions of `dir` and everything below it.
    pub fn invalidate(&self, dir: &str) {
        let mut inner = self.inner.write();
        inner.epoch += 1;
        for obj in inner.by_ino.values_mut() {
            if path::is_within(&obj.path, dir) {
                obj.resolved = None;
            }
        }
    }

    /// Drop every cached resolution (branch reconfiguration).
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write();
        inner.epoch += 1;
        for obj in inner.by_ino.values_mut() {
            obj.resolved = None;
        }
    }

    /// Forget `dir` and its descendants entirely after they were deleted.
    pub fn forget(&self, dir: &str) {
        let mut inner = self.inner.write();
        inner.epoch += 1;
        let doomed: Vec<u64> = inner
            .by_ino
            .values()
            .filter(|o| o.ino != ROOT_INO && path::is_within(&o.path, dir))
            .map(|o| o.ino)
            .collect();
        for ino in doomed {
            if let Some(obj) = inner.by_ino.remove(&ino) {
                inner.path_to_ino.remove(&obj.path);
            }
        }
    }

    /// Move the subtree at `from` to `to`, keeping inode numbers. Whatever
    /// was known at `to` is forgotten.
    pub fn rename(&self, from: &str, to: &str) {
        self.forget(to);
        let mut guard = self.inner.write();
        let inner = &mut *guard;
        inner.epoch += 1;
        let moved: Vec<(u64, String)> = inner
            .by_ino
            .values()
            .filter(|o| path::is_within(&o.path, from))
            .map(|o| (o.ino, path::rebase(&o.path, from, to)))
            .collect();
        for (ino, new_path) in moved {
            if let Some(obj) = inner.by_ino.get_mut(&ino) {
                let old = std::mem::replace(&mut obj.path, new_path.clone());
                obj.resolved = None;
                inner.path_to_ino.remove(&old);
                inner.path_to_ino.insert(new_path, ino);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
