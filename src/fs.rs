use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};

use crate::fs_helpers::{errno, file_type};
use crate::inode::ROOT_INO;
use crate::path;
use crate::union::Union;

// Branches can be reconfigured at any time, so the kernel must always come
// back to us instead of trusting cached entries.
const TTL: Duration = Duration::from_secs(0);
pub(crate) const BLOCK_SIZE: u32 = 512;

pub const CTL_FILE: &str = ".unionfs_ctl";
pub(crate) const CTL_INO: u64 = u64::MAX - 1;

pub struct UnionFs {
    pub(crate) union: Arc<Union>,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
}

impl UnionFs {
    pub fn new(union: Arc<Union>) -> Self {
        Self {
            union,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
        }
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        let parent_path = self.path_of(parent)?;
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(path::child(&parent_path, name))
    }

    /// Reply with the attributes of `path` after it was created or changed.
    fn entry_for(&self, path: &str, reply: ReplyEntry) {
        match self.union.stat(path) {
            Ok((_, st)) => {
                let ino = self.union.objects().get_or_create(path);
                reply.entry(&TTL, &self.make_attr(ino, &st), 0);
            }
            Err(e) => reply.error(errno("stat", path, &e)),
        }
    }

    fn remove(&self, parent: u64, name: &OsStr, want_dir: bool, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.resolve(&path) {
            Ok(r) if r.is_dir() && !want_dir => return reply.error(libc::EISDIR),
            Ok(r) if !r.is_dir() && want_dir => return reply.error(libc::ENOTDIR),
            Ok(_) => {}
            Err(e) => return reply.error(errno("remove", &path, &e)),
        }
        match self.union.delete(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("remove", &path, &e)),
        }
    }
}

impl Filesystem for UnionFs {
    fn destroy(&mut self) {
        match self.union.shutdown() {
            Ok(branches) => log::info!("unmounted; {} branches released", branches.len()),
            Err(e) => log::warn!("unmounted with open handles: {}", e),
        }
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent == ROOT_INO && name == CTL_FILE {
            reply.entry(&TTL, &self.ctl_file_attr(), 0);
            return;
        }
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        self.entry_for(&path, reply);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == CTL_INO {
            reply.attr(&TTL, &self.ctl_file_attr());
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.stat(&path) {
            Ok((_, st)) => reply.attr(&TTL, &self.make_attr(ino, &st)),
            Err(e) => reply.error(errno("getattr", &path, &e)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if ino == CTL_INO {
            reply.attr(&TTL, &self.ctl_file_attr());
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };

        if let Some(size) = size {
            if let Err(e) = self.union.truncate(&path, size) {
                return reply.error(errno("truncate", &path, &e));
            }
        }
        if let Some(mode) = mode {
            if let Err(e) = self.union.set_mode(&path, mode & 0o7777) {
                return reply.error(errno("chmod", &path, &e));
            }
        }

        match self.union.stat(&path) {
            Ok((_, st)) => reply.attr(&TTL, &self.make_attr(ino, &st)),
            Err(e) => reply.error(errno("setattr", &path, &e)),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.read_link(&path) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(errno("readlink", &path, &e)),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino == CTL_INO {
            reply.opened(0, 0);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let write = flags & libc::O_ACCMODE != libc::O_RDONLY;
        match self.union.open(&path, write) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(errno("open", &path, &e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if fh != 0 {
            self.union.release(fh);
        }
        reply.ok();
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        if ino == CTL_INO {
            self.handle_ctl_read(offset, size, reply);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.read(&path, offset.max(0) as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(errno("read", &path, &e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if ino == CTL_INO {
            self.handle_ctl_write(data, reply);
            return;
        }
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.write(&path, offset.max(0) as u64, data) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(errno("write", &path, &e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = match self.path_of(ino) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        let merged = match self.union.list_directory(&path) {
            Ok(m) => m,
            Err(e) => return reply.error(errno("readdir", &path, &e)),
        };

        let parent_ino = path::split(&path)
            .and_then(|(parent, _)| self.union.objects().get_ino(parent))
            .unwrap_or(ROOT_INO);
        let mut entries = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        if ino == ROOT_INO {
            entries.push((CTL_INO, FileType::RegularFile, CTL_FILE.to_string()));
        }
        for entry in merged {
            if ino == ROOT_INO && entry.name == CTL_FILE {
                continue;
            }
            let child_ino = self
                .union
                .objects()
                .get_or_create(&path::child(&path, &entry.name));
            entries.push((child_ino, file_type(entry.kind), entry.name));
        }

        for (i, (ino, kind, name)) in entries.into_iter().enumerate().skip(offset as usize) {
            if reply.add(ino, (i + 1) as i64, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        if let Err(e) = self.union.create(&path, mode & !umask & 0o7777) {
            return reply.error(errno("create", &path, &e));
        }
        let fh = match self.union.open(&path, true) {
            Ok(fh) => fh,
            Err(e) => return reply.error(errno("create", &path, &e)),
        };
        match self.union.stat(&path) {
            Ok((_, st)) => {
                let ino = self.union.objects().get_or_create(&path);
                reply.created(&TTL, &self.make_attr(ino, &st), 0, fh, 0);
            }
            Err(e) => {
                self.union.release(fh);
                reply.error(errno("create", &path, &e));
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.mkdir(&path, mode & !umask & 0o7777) {
            Ok(_) => self.entry_for(&path, reply),
            Err(e) => reply.error(errno("mkdir", &path, &e)),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => return reply.error(e),
        };
        match self.union.symlink(target, &path) {
            Ok(_) => self.entry_for(&path, reply),
            Err(e) => reply.error(errno("symlink", &path, &e)),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, false, reply);
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        self.remove(parent, name, true, reply);
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let (from, to) = match (self.child_path(parent, name), self.child_path(newparent, newname)) {
            (Ok(from), Ok(to)) => (from, to),
            (Err(e), _) | (_, Err(e)) => return reply.error(e),
        };
        match self.union.rename(&from, &to) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno("rename", &from, &e)),
        }
    }
}
