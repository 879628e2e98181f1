use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

/// Reader/writer locks keyed by logical directory.
///
/// Lookups and listings share a directory; anything that changes which
/// object a name inside it refers to holds it exclusively. A caller holds
/// at most one directory lock (or one ordered pair), never nested ones.
pub struct DirLocks {
    locks: DashMap<String, Arc<RwLock<()>>>,
}

impl DirLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, dir: &str) -> Arc<RwLock<()>> {
        self.locks.entry(dir.to_string()).or_default().clone()
    }

    /// Drop the entry for `dir` once nobody holds or waits on it.
    fn release(&self, dir: &str, lock: Arc<RwLock<()>>) {
        drop(lock);
        self.locks.remove_if(dir, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn shared<R>(&self, dir: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(dir);
        let result = {
            let _guard = lock.read();
            f()
        };
        self.release(dir, lock);
        result
    }

    pub fn exclusive<R>(&self, dir: &str, f: impl FnOnce() -> R) -> R {
        let lock = self.lock_for(dir);
        let result = {
            let _guard = lock.write();
            f()
        };
        self.release(dir, lock);
        result
    }

    /// Exclusive access to two directories, acquired in a fixed order.
    pub fn exclusive_pair<R>(&self, a: &str, b: &str, f: impl FnOnce() -> R) -> R {
        if a == b {
            return self.exclusive(a, f);
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first_lock = self.lock_for(first);
        let second_lock = self.lock_for(second);
        let result = {
            let _g1 = first_lock.write();
            let _g2 = second_lock.write();
            f()
        };
        self.release(second, second_lock);
        self.release(first, first_lock);
        result
    }

    /// Number of directories with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for DirLocks {
    fn default() -> Self {
        Self::new()
    }
}
