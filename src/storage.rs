use std::fs::{self, DirBuilder, File, FileTimes, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::unistd::{chown, Gid, Uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl FileKind {
    fn from_fs(ft: fs::FileType) -> Self {
        if ft.is_dir() {
            FileKind::Directory
        } else if ft.is_symlink() {
            FileKind::Symlink
        } else if ft.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        }
    }
}

/// Metadata of one physical object.
#[derive(Debug, Clone)]
pub struct Stat {
    pub kind: FileKind,
    pub size: u64,
    /// Permission bits only (no file type bits).
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub ino: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Physical primitives of one branch. Paths are branch-relative (`/a/b`) and
/// each call is atomic on its own.
pub trait Storage: Send + Sync {
    /// Stable identity of the underlying store, used to reject duplicates.
    fn identity(&self) -> String;

    /// `Ok(None)` when nothing exists at `path`. Symlinks are not followed.
    fn stat(&self, path: &str) -> io::Result<Option<Stat>>;

    fn read_at(&self, path: &str, offset: u64, len: usize) -> io::Result<Vec<u8>>;
    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> io::Result<usize>;

    /// Exclusive create of an empty regular file.
    fn create(&self, path: &str, mode: u32) -> io::Result<()>;
    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()>;
    fn symlink(&self, target: &Path, path: &str) -> io::Result<()>;
    fn read_link(&self, path: &str) -> io::Result<PathBuf>;

    fn unlink(&self, path: &str) -> io::Result<()>;
    fn rmdir(&self, path: &str) -> io::Result<()>;

    /// Atomic within this branch.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;
    fn link(&self, from: &str, to: &str) -> io::Result<()>;

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;

    fn truncate(&self, path: &str, size: u64) -> io::Result<()>;
    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()>;

    /// Apply mode, ownership and timestamps of `src` to the object at `path`.
    fn copy_metadata(&self, src: &Stat, path: &str) -> io::Result<()>;

    /// Whether `rename` replaces its destination atomically. Stores that
    /// return false get link-then-unlink emulation.
    fn supports_atomic_rename(&self) -> bool {
        true
    }
}

/// A branch backed by a directory on a local filesystem.
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn open(root: &Path) -> io::Result<Self> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::other(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn real(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

fn is_absent(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENOTDIR)
}

impl Storage for DiskStorage {
    fn identity(&self) -> String {
        self.root.to_string_lossy().into_owned()
    }

    fn stat(&self, path: &str) -> io::Result<Option<Stat>> {
        let meta = match fs::symlink_metadata(self.real(path)) {
            Ok(m) => m,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(Some(Stat {
            kind: FileKind::from_fs(meta.file_type()),
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            nlink: meta.nlink() as u32,
            ino: meta.ino(),
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime: UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
        }))
    }

    fn read_at(&self, path: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let file = File::open(self.real(path))?;
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> io::Result<usize> {
        let file = OpenOptions::new().write(true).open(self.real(path))?;
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    fn create(&self, path: &str, mode: u32) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(self.real(path))?;
        Ok(())
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        DirBuilder::new().mode(mode).create(self.real(path))
    }

    fn symlink(&self, target: &Path, path: &str) -> io::Result<()> {
        std::os::unix::fs::symlink(target, self.real(path))
    }

    fn read_link(&self, path: &str) -> io::Result<PathBuf> {
        fs::read_link(self.real(path))
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.real(path))
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        fs::remove_dir(self.real(path))
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.real(from), self.real(to))
    }

    fn link(&self, from: &str, to: &str) -> io::Result<()> {
        fs::hard_link(self.real(from), self.real(to))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.real(path))? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind: FileKind::from_fs(entry.file_type()?),
            });
        }
        Ok(entries)
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        OpenOptions::new()
            .write(true)
            .open(self.real(path))?
            .set_len(size)
    }

    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()> {
        fs::set_permissions(self.real(path), fs::Permissions::from_mode(mode & 0o7777))
    }

    fn copy_metadata(&self, src: &Stat, path: &str) -> io::Result<()> {
        if src.kind == FileKind::Symlink {
            return Ok(());
        }
        let real = self.real(path);
        fs::set_permissions(&real, fs::Permissions::from_mode(src.mode))?;

        // Unprivileged mounts cannot give files away; keep the caller's ids.
        match chown(
            &real,
            Some(Uid::from_raw(src.uid)),
            Some(Gid::from_raw(src.gid)),
        ) {
            Ok(()) => {}
            Err(Errno::EPERM) => {
                log::debug!("ownership of {:?} not copied: EPERM", real);
            }
            Err(e) => return Err(io::Error::from(e)),
        }

        let times = FileTimes::new()
            .set_accessed(src.atime)
            .set_modified(src.mtime);
        File::open(&real)?.set_times(times)
    }
}
