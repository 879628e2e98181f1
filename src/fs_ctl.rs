use std::path::PathBuf;
use std::str::FromStr;

use fuser::{ReplyData, ReplyWrite};

use crate::branch::{BranchId, BranchOp, Permission};
use crate::error::{Result, UnionError};
use crate::fs::UnionFs;
use crate::union::Union;

/// A command written to the control file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CtlCommand {
    /// `add:<path>=<perm>[@<pos>]`; without a position the branch goes to
    /// the bottom.
    Add {
        path: PathBuf,
        permission: Permission,
        position: Option<usize>,
    },
    /// `del:<id>`
    Remove(BranchId),
    /// `mod:<id>=<perm>`
    SetPermission { id: BranchId, permission: Permission },
    /// `reorder:<id>,<id>,...`
    Reorder(Vec<BranchId>),
    /// `target:<dir>=<id>`
    SetTarget { dir: String, id: BranchId },
    /// `untarget:<dir>`
    ClearTarget(String),
}

fn parse_id(s: &str) -> Result<BranchId> {
    s.trim()
        .parse::<u64>()
        .map(BranchId)
        .map_err(|_| UnionError::Config(format!("bad branch id '{}'", s)))
}

fn split_eq<'a>(cmd: &str, arg: &'a str) -> Result<(&'a str, &'a str)> {
    arg.rsplit_once('=')
        .ok_or_else(|| UnionError::Config(format!("{}: expected '<x>=<y>'", cmd)))
}

impl FromStr for CtlCommand {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (cmd, arg) = s
            .split_once(':')
            .ok_or_else(|| UnionError::Config(format!("unknown control command '{}'", s)))?;

        match cmd.to_lowercase().as_str() {
            "add" => {
                let (spec, position) = match arg.rsplit_once('@') {
                    Some((spec, pos)) if !pos.is_empty() && pos.bytes().all(|b| b.is_ascii_digit()) => {
                        let position = pos
                            .parse()
                            .map_err(|_| UnionError::Config(format!("bad position '{}'", pos)))?;
                        (spec, Some(position))
                    }
                    _ => (arg, None),
                };
                let (path, perm) = split_eq(cmd, spec)?;
                if path.is_empty() {
                    return Err(UnionError::Config("add: empty path".into()));
                }
                Ok(CtlCommand::Add {
                    path: PathBuf::from(path),
                    permission: perm.parse()?,
                    position,
                })
            }
            "del" => Ok(CtlCommand::Remove(parse_id(arg)?)),
            "mod" => {
                let (id, perm) = split_eq(cmd, arg)?;
                Ok(CtlCommand::SetPermission {
                    id: parse_id(id)?,
                    permission: perm.parse()?,
                })
            }
            "reorder" => Ok(CtlCommand::Reorder(
                arg.split(',').map(parse_id).collect::<Result<_>>()?,
            )),
            "target" => {
                let (dir, id) = split_eq(cmd, arg)?;
                Ok(CtlCommand::SetTarget {
                    dir: dir.to_string(),
                    id: parse_id(id)?,
                })
            }
            "untarget" => Ok(CtlCommand::ClearTarget(arg.to_string())),
            _ => Err(UnionError::Config(format!("unknown control command '{}'", cmd))),
        }
    }
}

impl CtlCommand {
    pub fn apply(self, union: &Union) -> Result<()> {
        match self {
            CtlCommand::Add {
                path,
                permission,
                position,
            } => {
                let position = position.unwrap_or_else(|| union.branches().len());
                union.add_branch(&path, permission, position)
            }
            CtlCommand::Remove(id) => union.reconfigure_branches(BranchOp::Remove(id)),
            CtlCommand::SetPermission { id, permission } => {
                union.reconfigure_branches(BranchOp::SetPermission { id, permission })
            }
            CtlCommand::Reorder(order) => union.reconfigure_branches(BranchOp::Reorder(order)),
            CtlCommand::SetTarget { dir, id } => union.set_write_target(&dir, id),
            CtlCommand::ClearTarget(dir) => {
                union.clear_write_target(&dir);
                Ok(())
            }
        }
    }
}

impl UnionFs {
    /// Handle a write to the control file.
    pub(crate) fn handle_ctl_write(&self, data: &[u8], reply: ReplyWrite) {
        let text = String::from_utf8_lossy(data);
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            log::info!("control command: '{}'", line);
            let result = line.parse::<CtlCommand>().and_then(|cmd| cmd.apply(&self.union));
            if let Err(e) = result {
                log::warn!("control command '{}' failed: {}", line, e);
                reply.error(e.errno());
                return;
            }
        }
        reply.written(data.len() as u32);
    }

    /// The control file reads as the current branch list.
    pub(crate) fn handle_ctl_read(&self, offset: i64, size: u32, reply: ReplyData) {
        let listing = match serde_json::to_vec_pretty(&self.union.branches()) {
            Ok(mut v) => {
                v.push(b'\n');
                v
            }
            Err(e) => {
                log::error!("could not render branch list: {}", e);
                reply.error(libc::EIO);
                return;
            }
        };
        let start = (offset.max(0) as usize).min(listing.len());
        let end = (start + size as usize).min(listing.len());
        reply.data(&listing[start..end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_command() {
        assert_eq!(
            "add:/srv/extra=ro@1".parse::<CtlCommand>().unwrap(),
            CtlCommand::Add {
                path: PathBuf::from("/srv/extra"),
                permission: Permission::ReadOnly,
                position: Some(1),
            }
        );
        assert_eq!(
            "del:3".parse::<CtlCommand>().unwrap(),
            CtlCommand::Remove(BranchId(3))
        );
        assert_eq!(
            "mod:0=rr\n".parse::<CtlCommand>().unwrap(),
            CtlCommand::SetPermission {
                id: BranchId(0),
                permission: Permission::RealReadOnly,
            }
        );
        assert_eq!(
            "reorder:2,0,1".parse::<CtlCommand>().unwrap(),
            CtlCommand::Reorder(vec![BranchId(2), BranchId(0), BranchId(1)])
        );
        assert_eq!(
            "target:/logs=1".parse::<CtlCommand>().unwrap(),
            CtlCommand::SetTarget {
                dir: "/logs".into(),
                id: BranchId(1),
            }
        );
    }

    #[test]
    fn at_sign_without_digits_belongs_to_the_path() {
        assert_eq!(
            "add:/mnt/a@b=rw".parse::<CtlCommand>().unwrap(),
            CtlCommand::Add {
                path: PathBuf::from("/mnt/a@b"),
                permission: Permission::ReadWrite,
                position: None,
            }
        );
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["commit", "del:x", "mod:1", "mod:1=xx", "add:=rw", "frob:1"] {
            assert!(bad.parse::<CtlCommand>().is_err(), "{}", bad);
        }
    }
}
