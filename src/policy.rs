use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use crate::branch::{BranchId, TableState};
use crate::error::{Result, UnionError};
use crate::path;
use crate::resolve::ResolvedPath;

/// Where an existing object goes when it must become writable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CopyUpPolicy {
    /// Topmost writable branch at or above the object, promoting objects
    /// that already sit on a lower writable branch.
    #[default]
    TopmostWritable,
    /// Leave objects on writable branches alone; otherwise use the nearest
    /// writable branch above the object.
    NearestWritableAbove,
}

/// Where a new object is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CreatePolicy {
    #[default]
    TopmostWritable,
    /// Topmost writable branch that already holds the parent directory.
    TopDownParent,
    /// Rotate over the usable writable branches.
    RoundRobin,
}

/// Order index of the branch an existing object is made writable on.
pub fn copyup_target(
    policy: CopyUpPolicy,
    table: &TableState,
    resolved: &ResolvedPath,
) -> Result<usize> {
    let writable = |i: &usize| table.get(*i).accepts_writes();

    let found = if resolved.path == path::ROOT {
        // Every branch down to the root's bottom already holds it.
        (0..=resolved.bottom).find(writable)
    } else {
        match policy {
            CopyUpPolicy::TopmostWritable => (0..=resolved.effective).find(writable),
            CopyUpPolicy::NearestWritableAbove => {
                if writable(&resolved.effective) {
                    Some(resolved.effective)
                } else {
                    (0..resolved.effective).rev().find(writable)
                }
            }
        }
    };
    found.ok_or_else(|| UnionError::ReadOnly(resolved.path.clone()))
}

/// Order index of the branch a new entry of `parent` is created on.
///
/// A branch is usable when it accepts writes, is not below the parent's
/// lowest branch, and is not below a whiteout for the name.
pub fn create_target(
    policy: CreatePolicy,
    table: &TableState,
    parent: &ResolvedPath,
    whiteout_at: Option<usize>,
    preferred: Option<BranchId>,
    rotor: &AtomicUsize,
) -> Result<usize> {
    let limit = whiteout_at.unwrap_or(usize::MAX).min(parent.bottom);
    let usable: Vec<usize> = (0..table.len())
        .filter(|&i| i <= limit && table.get(i).accepts_writes())
        .collect();

    if let Some(id) = preferred {
        match table.index_of(id) {
            Some(i) if usable.contains(&i) => return Ok(i),
            _ => log::debug!(
                "write target {} not usable below {}, falling back to policy",
                id,
                parent.path
            ),
        }
    }

    let chosen = match policy {
        CreatePolicy::TopmostWritable => usable.first().copied(),
        CreatePolicy::TopDownParent => usable
            .iter()
            .copied()
            .find(|&i| parent.dir_at(i))
            .or_else(|| usable.first().copied()),
        CreatePolicy::RoundRobin => {
            if usable.is_empty() {
                None
            } else {
                let n = rotor.fetch_add(1, Ordering::Relaxed);
                Some(usable[n % usable.len()])
            }
        }
    };
    chosen.ok_or_else(|| UnionError::ReadOnly(parent.path.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::branch::{BranchTable, Permission};
    use crate::resolve::Layer;
    use crate::storage::{DiskStorage, FileKind, Storage};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn table(perms: &[Permission]) -> (Vec<TempDir>, BranchTable) {
        let dirs: Vec<TempDir> = perms.iter().map(|_| TempDir::new().unwrap()).collect();
        let initial = dirs
            .iter()
            .zip(perms)
            .map(|(d, p)| {
                (
                    Arc::new(DiskStorage::open(d.path()).unwrap()) as Arc<dyn Storage>,
                    *p,
                )
            })
            .collect();
        (dirs, BranchTable::new(initial).unwrap())
    }

    fn dir_at(path: &str, n: usize, effective: usize, bottom: usize) -> ResolvedPath {
        ResolvedPath {
            path: path.to_string(),
            layers: (0..n)
                .map(|i| Layer {
                    branch: BranchId(i as u64),
                    kind: (i >= effective && i <= bottom).then_some(FileKind::Directory),
                    whiteout: false,
                    opaque: false,
                })
                .collect(),
            effective,
            bottom,
            kind: FileKind::Directory,
            generation: 1,
        }
    }

    use Permission::{ReadOnly as RO, ReadWrite as RW};

    #[test]
    fn topmost_writable_promotes_from_lower_writable() {
        let (_d, t) = table(&[RW, RO, RW]);
        let state = t.read();
        let obj = dir_at("/f", 3, 2, 2);
        assert_eq!(
            copyup_target(CopyUpPolicy::TopmostWritable, &state, &obj).unwrap(),
            0
        );
        assert_eq!(
            copyup_target(CopyUpPolicy::NearestWritableAbove, &state, &obj).unwrap(),
            2
        );
    }

    #[test]
    fn nearest_writable_above_skips_to_closest() {
        let (_d, t) = table(&[RW, RW, RO]);
        let state = t.read();
        let obj = dir_at("/f", 3, 2, 2);
        assert_eq!(
            copyup_target(CopyUpPolicy::NearestWritableAbove, &state, &obj).unwrap(),
            1
        );
    }

    #[test]
    fn writable_branch_below_the_object_is_useless() {
        let (_d, t) = table(&[RO, RW]);
        let state = t.read();
        let obj = dir_at("/f", 2, 0, 0);
        assert!(matches!(
            copyup_target(CopyUpPolicy::TopmostWritable, &state, &obj).unwrap_err(),
            UnionError::ReadOnly(_)
        ));
    }

    #[test]
    fn create_respects_whiteouts_and_overrides() {
        let (_d, t) = table(&[RO, RW, RW]);
        let state = t.read();
        let rotor = AtomicUsize::new(0);
        let parent = dir_at("/d", 3, 0, 2);

        let pick = |policy, wh, pref| create_target(policy, &state, &parent, wh, pref, &rotor);

        assert_eq!(pick(CreatePolicy::TopmostWritable, None, None).unwrap(), 1);
        assert_eq!(
            pick(CreatePolicy::TopmostWritable, None, Some(BranchId(2))).unwrap(),
            2
        );
        // A whiteout on the read-only top leaves nothing usable.
        assert!(pick(CreatePolicy::TopmostWritable, Some(0), None).is_err());
        // Override below the whiteout is ignored.
        assert_eq!(
            pick(CreatePolicy::TopmostWritable, Some(1), Some(BranchId(2))).unwrap(),
            1
        );
    }

    #[test]
    fn top_down_parent_prefers_existing_parent() {
        let (_d, t) = table(&[RW, RW]);
        let state = t.read();
        let rotor = AtomicUsize::new(0);
        let parent = dir_at("/d", 2, 1, 1);
        assert_eq!(
            create_target(CreatePolicy::TopDownParent, &state, &parent, None, None, &rotor)
                .unwrap(),
            1
        );
        assert_eq!(
            create_target(CreatePolicy::TopmostWritable, &state, &parent, None, None, &rotor)
                .unwrap(),
            0
        );
    }

    #[test]
    fn round_robin_rotates() {
        let (_d, t) = table(&[RW, RW]);
        let state = t.read();
        let rotor = AtomicUsize::new(0);
        let parent = dir_at("/", 2, 0, 1);
        let picks: Vec<usize> = (0..4)
            .map(|_| {
                create_target(CreatePolicy::RoundRobin, &state, &parent, None, None, &rotor)
                    .unwrap()
            })
            .collect();
        assert_eq!(picks, vec![0, 1, 0, 1]);
    }
}
