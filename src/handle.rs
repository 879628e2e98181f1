use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::branch::BranchId;

/// Reports live references into a branch. The branch table consults it
/// before removing or downgrading a branch.
pub trait OpenReferences {
    fn has_refs(&self, branch: BranchId) -> bool;
    fn has_writers(&self, branch: BranchId) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub path: String,
    pub branch: BranchId,
    pub write: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    readers: usize,
    writers: usize,
}

/// Tracks open file handles and the branch each one is pinned to.
pub struct HandleTracker {
    next_fh: AtomicU64,
    handles: DashMap<u64, OpenHandle>,
    counts: DashMap<BranchId, Counts>,
}

impl HandleTracker {
    pub fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: DashMap::new(),
            counts: DashMap::new(),
        }
    }

    pub fn register(&self, path: &str, branch: BranchId, write: bool) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        {
            let mut counts = self.counts.entry(branch).or_default();
            if write {
                counts.writers += 1;
            } else {
                counts.readers += 1;
            }
        }
        self.handles.insert(
            fh,
            OpenHandle {
                path: path.to_string(),
                branch,
                write,
            },
        );
        fh
    }

    pub fn get(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.get(&fh).map(|h| h.clone())
    }

    /// Drop a handle. Returns it so the caller can tell whether its branch
    /// just went quiet.
    pub fn release(&self, fh: u64) -> Option<OpenHandle> {
        let (_, handle) = self.handles.remove(&fh)?;
        let mut now_idle = false;
        if let Some(mut counts) = self.counts.get_mut(&handle.branch) {
            if handle.write {
                counts.writers = counts.writers.saturating_sub(1);
            } else {
                counts.readers = counts.readers.saturating_sub(1);
            }
            now_idle = counts.readers == 0 && counts.writers == 0;
        }
        if now_idle {
            self.counts
                .remove_if(&handle.branch, |_, c| c.readers == 0 && c.writers == 0);
        }
        Some(handle)
    }

    /// Re-pin the handles of `path` (and below) after it moved.
    pub fn rename_prefix(&self, from: &str, to: &str) {
        for mut entry in self.handles.iter_mut() {
            if crate::path::is_within(&entry.path, from) {
                entry.path = crate::path::rebase(&entry.path, from, to);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Some branch that still has an open handle.
    pub fn any_pinned_branch(&self) -> Option<BranchId> {
        self.handles.iter().next().map(|h| h.branch)
    }
}

impl Default for HandleTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenReferences for HandleTracker {
    fn has_refs(&self, branch: BranchId) -> bool {
        self.counts
            .get(&branch)
            .map(|c| c.readers + c.writers > 0)
            .unwrap_or(false)
    }

    fn has_writers(&self, branch: BranchId) -> bool {
        self.counts
            .get(&branch)
            .map(|c| c.writers > 0)
            .unwrap_or(false)
    }
}
