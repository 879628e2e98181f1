use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnionError};
use crate::handle::OpenReferences;
use crate::storage::Storage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(pub u64);

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "rw")]
    ReadWrite,
    #[serde(rename = "ro")]
    ReadOnly,
    /// The store itself refuses writes, so the union never probes it for
    /// writability.
    #[serde(rename = "rr")]
    RealReadOnly,
}

impl Permission {
    pub fn is_writable(self) -> bool {
        self == Permission::ReadWrite
    }
}

impl FromStr for Permission {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rw" => Ok(Permission::ReadWrite),
            "ro" => Ok(Permission::ReadOnly),
            "rr" => Ok(Permission::RealReadOnly),
            other => Err(UnionError::Config(format!(
                "unknown branch permission '{}' (expected rw, ro or rr)",
                other
            ))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Permission::ReadWrite => "rw",
            Permission::ReadOnly => "ro",
            Permission::RealReadOnly => "rr",
        };
        f.write_str(s)
    }
}

pub struct Branch {
    pub id: BranchId,
    pub storage: Arc<dyn Storage>,
    pub permission: Permission,
    /// Set when removal was requested while handles were open; the branch
    /// leaves the table once the last handle is released.
    pub removing: bool,
}

impl Branch {
    /// Whether new objects and copy-ups may land on this branch.
    pub fn accepts_writes(&self) -> bool {
        self.permission.is_writable() && !self.removing
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("storage", &self.storage.identity())
            .field("permission", &self.permission)
            .field("removing", &self.removing)
            .finish()
    }
}

pub enum BranchOp {
    Add {
        storage: Arc<dyn Storage>,
        permission: Permission,
        position: usize,
    },
    Remove(BranchId),
    /// New top-to-bottom order, as a permutation of the current ids.
    Reorder(Vec<BranchId>),
    SetPermission {
        id: BranchId,
        permission: Permission,
    },
}

/// Summary of a branch for listings and the control surface.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchInfo {
    pub id: BranchId,
    pub index: usize,
    pub storage: String,
    pub permission: Permission,
    pub removing: bool,
}

/// The ordered branch list. Position in `branches` is the order index:
/// index 0 is the topmost branch.
pub struct TableState {
    branches: Vec<Branch>,
    generation: u64,
}

impl TableState {
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn get(&self, index: usize) -> &Branch {
        &self.branches[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Branch> {
        self.branches.iter()
    }

    pub fn index_of(&self, id: BranchId) -> Option<usize> {
        self.branches.iter().position(|b| b.id == id)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn ids(&self) -> Vec<BranchId> {
        self.branches.iter().map(|b| b.id).collect()
    }

    pub fn topmost_writable(&self) -> Option<usize> {
        self.branches.iter().position(|b| b.accepts_writes())
    }

    pub fn info(&self) -> Vec<BranchInfo> {
        self.branches
            .iter()
            .enumerate()
            .map(|(index, b)| BranchInfo {
                id: b.id,
                index,
                storage: b.storage.identity(),
                permission: b.permission,
                removing: b.removing,
            })
            .collect()
    }

    fn require(&self, id: BranchId) -> Result<usize> {
        self.index_of(id).ok_or(UnionError::UnknownBranch(id.0))
    }

    fn add(
        &mut self,
        id: BranchId,
        storage: Arc<dyn Storage>,
        permission: Permission,
        position: usize,
    ) -> Result<()> {
        if position > self.branches.len() {
            return Err(UnionError::InvalidPosition {
                position,
                len: self.branches.len(),
            });
        }
        let identity = storage.identity();
        if self.branches.iter().any(|b| b.storage.identity() == identity) {
            return Err(UnionError::DuplicateStorage(identity));
        }
        self.branches.insert(
            position,
            Branch {
                id,
                storage,
                permission,
                removing: false,
            },
        );
        Ok(())
    }

    fn remove(&mut self, id: BranchId, refs: &dyn OpenReferences) -> Result<Branch> {
        let index = self.require(id)?;
        if self.branches.len() == 1 {
            return Err(UnionError::LastBranch);
        }
        if refs.has_refs(id) {
            self.branches[index].removing = true;
            return Err(UnionError::Busy(id.0));
        }
        Ok(self.branches.remove(index))
    }

    fn reorder(&mut self, order: &[BranchId]) -> Result<()> {
        if order.len() != self.branches.len() {
            return Err(UnionError::InvalidPermutation(format!(
                "expected {} ids, got {}",
                self.branches.len(),
                order.len()
            )));
        }
        let mut seen = HashSet::with_capacity(order.len());
        for id in order {
            if self.index_of(*id).is_none() {
                return Err(UnionError::InvalidPermutation(format!(
                    "unknown branch id {}",
                    id
                )));
            }
            if !seen.insert(*id) {
                return Err(UnionError::InvalidPermutation(format!(
                    "branch id {} listed twice",
                    id
                )));
            }
        }

        let mut old: HashMap<BranchId, Branch> = std::mem::take(&mut self.branches)
            .into_iter()
            .map(|b| (b.id, b))
            .collect();
        self.branches = order.iter().filter_map(|id| old.remove(id)).collect();
        Ok(())
    }

    fn set_permission(
        &mut self,
        id: BranchId,
        permission: Permission,
        refs: &dyn OpenReferences,
    ) -> Result<()> {
        let index = self.require(id)?;
        let branch = &mut self.branches[index];
        if branch.permission.is_writable() && !permission.is_writable() && refs.has_writers(id) {
            return Err(UnionError::Busy(id.0));
        }
        branch.permission = permission;
        Ok(())
    }
}

pub struct BranchTable {
    state: RwLock<TableState>,
    next_id: AtomicU64,
}

impl BranchTable {
    /// Build a table from top-to-bottom `(storage, permission)` pairs.
    pub fn new(initial: Vec<(Arc<dyn Storage>, Permission)>) -> Result<Self> {
        if initial.is_empty() {
            return Err(UnionError::Config("at least one branch is required".into()));
        }
        let mut state = TableState {
            branches: Vec::with_capacity(initial.len()),
            generation: 1,
        };
        let mut next = 0;
        for (storage, permission) in initial {
            let position = state.len();
            state.add(BranchId(next), storage, permission, position)?;
            next += 1;
        }
        Ok(Self {
            state: RwLock::new(state),
            next_id: AtomicU64::new(next),
        })
    }

    /// Shared access for the duration of one logical operation. Holding it
    /// keeps reconfiguration out, so callers take it exactly once and pass
    /// the state down.
    pub fn read(&self) -> RwLockReadGuard<'_, TableState> {
        self.state.read()
    }

    /// Apply one reconfiguration under the table-wide exclusive lock. On
    /// error the table is left as it was (a busy removal only flags the
    /// branch). Returns the branch taken out of the table, if any.
    pub fn apply(&self, op: BranchOp, refs: &dyn OpenReferences) -> Result<Option<Branch>> {
        let mut state = self.state.write();
        let removed = match op {
            BranchOp::Add {
                storage,
                permission,
                position,
            } => {
                // Only consume an id once the insert is known to succeed.
                let id = BranchId(self.next_id.load(Ordering::SeqCst));
                state.add(id, storage, permission, position)?;
                self.next_id.fetch_add(1, Ordering::SeqCst);
                log::info!("added branch {} at position {} ({})", id, position, permission);
                None
            }
            BranchOp::Remove(id) => {
                let branch = state.remove(id, refs)?;
                log::info!("removed branch {} ({})", id, branch.storage.identity());
                Some(branch)
            }
            BranchOp::Reorder(order) => {
                state.reorder(&order)?;
                log::info!("reordered branches: {:?}", order);
                None
            }
            BranchOp::SetPermission { id, permission } => {
                state.set_permission(id, permission, refs)?;
                log::info!("branch {} is now {}", id, permission);
                None
            }
        };
        state.generation += 1;
        Ok(removed)
    }

    /// Finish a deferred removal once the branch has gone quiet.
    pub fn reap(&self, id: BranchId, refs: &dyn OpenReferences) -> Option<Branch> {
        let mut state = self.state.write();
        let index = state.index_of(id)?;
        if !state.branches[index].removing || refs.has_refs(id) {
            return None;
        }
        if state.len() == 1 {
            log::warn!("deferred removal of branch {} dropped: it is the last branch", id);
            state.branches[index].removing = false;
            return None;
        }
        let branch = state.branches.remove(index);
        state.generation += 1;
        log::info!("completed deferred removal of branch {}", id);
        Some(branch)
    }

    /// Take the table exclusively, waiting for every in-flight operation.
    pub fn drain(&self) -> Vec<BranchInfo> {
        self.state.write().info()
    }
}
