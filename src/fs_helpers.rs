use std::time::UNIX_EPOCH;

use fuser::{FileAttr, FileType};

use crate::error::UnionError;
use crate::fs::{UnionFs, BLOCK_SIZE, CTL_INO};
use crate::storage::{FileKind, Stat};

pub(crate) fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::File | FileKind::Other => FileType::RegularFile,
    }
}

/// Errno for a failed operation, logged at a level matching how unusual the
/// failure is.
pub(crate) fn errno(op: &str, path: &str, e: &UnionError) -> i32 {
    match e {
        UnionError::NotFound(_) | UnionError::Exists(_) | UnionError::NotEmpty(_) => {
            log::debug!("{} {}: {}", op, path, e)
        }
        UnionError::CopyUpFailed { .. }
        | UnionError::CopyFailed { .. }
        | UnionError::DeleteFailed { .. }
        | UnionError::RenameFailed { .. }
        | UnionError::Storage(_) => log::error!("{} {}: {}", op, path, e),
        _ => log::info!("{} {}: {}", op, path, e),
    }
    e.errno()
}

impl UnionFs {
    pub(crate) fn make_attr(&self, ino: u64, st: &Stat) -> FileAttr {
        FileAttr {
            ino,
            size: st.size,
            blocks: st.size.div_ceil(BLOCK_SIZE as u64),
            atime: st.atime,
            mtime: st.mtime,
            ctime: st.ctime,
            crtime: UNIX_EPOCH,
            kind: file_type(st.kind),
            perm: (st.mode & 0o7777) as u16,
            nlink: st.nlink,
            uid: st.uid,
            gid: st.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Attributes of the synthetic control file.
    pub(crate) fn ctl_file_attr(&self) -> FileAttr {
        FileAttr {
            ino: CTL_INO,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::RegularFile,
            perm: 0o600,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    /// Logical path of `ino`, or the errno to reply with.
    pub(crate) fn path_of(&self, ino: u64) -> Result<String, i32> {
        self.union.objects().get_path(ino).ok_or(libc::ENOENT)
    }
}
