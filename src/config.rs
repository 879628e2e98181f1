use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::branch::Permission;
use crate::error::{Result, UnionError};
use crate::policy::{CopyUpPolicy, CreatePolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSpec {
    pub path: PathBuf,
    /// Defaults to `rw` for the top branch and `ro` for the others.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission: Option<Permission>,
}

impl BranchSpec {
    /// Parse `path` or `path=perm`.
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(UnionError::Config("empty branch specification".into()));
        }
        if let Some((path, perm)) = s.rsplit_once('=') {
            if let Ok(permission) = perm.parse::<Permission>() {
                if path.is_empty() {
                    return Err(UnionError::Config(format!("branch '{}' has no path", s)));
                }
                return Ok(Self {
                    path: PathBuf::from(path),
                    permission: Some(permission),
                });
            }
        }
        Ok(Self {
            path: PathBuf::from(s),
            permission: None,
        })
    }
}

/// Branches come from a JSON file or a `br:/upper=rw:/lower=ro` option
/// string, top branch first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnionConfig {
    #[serde(default)]
    pub branches: Vec<BranchSpec>,
    #[serde(default)]
    pub copyup: CopyUpPolicy,
    #[serde(default)]
    pub create: CreatePolicy,
}

impl UnionConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| UnionError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Parse a colon separated branch list, with or without a leading `br:`
    /// or `br=`.
    pub fn parse_branches(s: &str) -> Result<Vec<BranchSpec>> {
        let list = s
            .strip_prefix("br:")
            .or_else(|| s.strip_prefix("br="))
            .unwrap_or(s);
        list.split(':')
            .filter(|part| !part.is_empty())
            .map(BranchSpec::parse)
            .collect()
    }

    /// Top-to-bottom branches with their effective permissions.
    pub fn branch_list(&self) -> Result<Vec<(PathBuf, Permission)>> {
        if self.branches.is_empty() {
            return Err(UnionError::Config("no branches configured".into()));
        }
        Ok(self
            .branches
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let default = if i == 0 {
                    Permission::ReadWrite
                } else {
                    Permission::ReadOnly
                };
                (b.path.clone(), b.permission.unwrap_or(default))
            })
            .collect())
    }
}
