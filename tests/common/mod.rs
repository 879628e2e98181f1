#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use unionfs::storage::{DirEntry, DiskStorage, Stat, Storage};
use unionfs::{Permission, Union, UnionOptions};

/// A union over temporary directories, index 0 on top.
pub struct Stack {
    pub dirs: Vec<TempDir>,
    pub union: Union,
}

impl Stack {
    pub fn new(perms: &[Permission]) -> Self {
        Self::with_options(perms, UnionOptions::default())
    }

    pub fn with_options(perms: &[Permission], options: UnionOptions) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let dirs: Vec<TempDir> = perms.iter().map(|_| TempDir::new().unwrap()).collect();
        let branches = dirs
            .iter()
            .zip(perms)
            .map(|(d, p)| {
                (
                    Arc::new(DiskStorage::open(d.path()).unwrap()) as Arc<dyn Storage>,
                    *p,
                )
            })
            .collect();
        let union = Union::new(branches, options).unwrap();
        Self { dirs, union }
    }

    pub fn branch(&self, i: usize) -> &Path {
        self.dirs[i].path()
    }

    pub fn file(&self, i: usize, rel: &str) -> PathBuf {
        self.branch(i).join(rel.trim_start_matches('/'))
    }

    /// Write a file straight into branch `i`, creating parents.
    pub fn put(&self, i: usize, rel: &str, data: &[u8]) {
        let p = self.file(i, rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, data).unwrap();
    }

    pub fn put_dir(&self, i: usize, rel: &str) {
        fs::create_dir_all(self.file(i, rel)).unwrap();
    }

    pub fn exists(&self, i: usize, rel: &str) -> bool {
        fs::symlink_metadata(self.file(i, rel)).is_ok()
    }

    pub fn raw(&self, i: usize, rel: &str) -> Vec<u8> {
        fs::read(self.file(i, rel)).unwrap()
    }

    /// Physical entries of a directory in branch `i`, markers included.
    pub fn raw_names(&self, i: usize, rel: &str) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.file(i, rel))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Merged listing of a union directory.
    pub fn names(&self, path: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .union
            .list_directory(path)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        names
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        self.union.read(path, 0, 1 << 20).unwrap()
    }
}

/// Disk storage whose individual primitives can be made to fail.
pub struct FaultyStorage {
    inner: DiskStorage,
    pub fail_write: AtomicBool,
    pub fail_rename: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_link: AtomicBool,
    /// Reported by `supports_atomic_rename`.
    pub atomic_rename: AtomicBool,
}

impl FaultyStorage {
    pub fn open(root: &Path) -> Self {
        Self {
            inner: DiskStorage::open(root).unwrap(),
            fail_write: AtomicBool::new(false),
            fail_rename: AtomicBool::new(false),
            fail_create: AtomicBool::new(false),
            fail_link: AtomicBool::new(false),
            atomic_rename: AtomicBool::new(true),
        }
    }

    fn check(flag: &AtomicBool) -> io::Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(io::Error::from_raw_os_error(libc::ENOSPC))
        } else {
            Ok(())
        }
    }
}

impl Storage for FaultyStorage {
    fn identity(&self) -> String {
        self.inner.identity()
    }

    fn stat(&self, path: &str) -> io::Result<Option<Stat>> {
        self.inner.stat(path)
    }

    fn read_at(&self, path: &str, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.inner.read_at(path, offset, len)
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> io::Result<usize> {
        Self::check(&self.fail_write)?;
        self.inner.write_at(path, offset, data)
    }

    fn create(&self, path: &str, mode: u32) -> io::Result<()> {
        Self::check(&self.fail_create)?;
        self.inner.create(path, mode)
    }

    fn mkdir(&self, path: &str, mode: u32) -> io::Result<()> {
        self.inner.mkdir(path, mode)
    }

    fn symlink(&self, target: &Path, path: &str) -> io::Result<()> {
        self.inner.symlink(target, path)
    }

    fn read_link(&self, path: &str) -> io::Result<PathBuf> {
        self.inner.read_link(path)
    }

    fn unlink(&self, path: &str) -> io::Result<()> {
        self.inner.unlink(path)
    }

    fn rmdir(&self, path: &str) -> io::Result<()> {
        self.inner.rmdir(path)
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        Self::check(&self.fail_rename)?;
        self.inner.rename(from, to)
    }

    fn link(&self, from: &str, to: &str) -> io::Result<()> {
        Self::check(&self.fail_link)?;
        self.inner.link(from, to)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        self.inner.read_dir(path)
    }

    fn truncate(&self, path: &str, size: u64) -> io::Result<()> {
        self.inner.truncate(path, size)
    }

    fn set_mode(&self, path: &str, mode: u32) -> io::Result<()> {
        self.inner.set_mode(path, mode)
    }

    fn copy_metadata(&self, src: &Stat, path: &str) -> io::Result<()> {
        self.inner.copy_metadata(src, path)
    }

    fn supports_atomic_rename(&self) -> bool {
        self.atomic_rename.load(Ordering::SeqCst)
    }
}

/// A writable faulty branch on top of a read-only disk branch.
pub fn faulty_stack() -> (Vec<TempDir>, Arc<FaultyStorage>, Union) {
    let _ = env_logger::builder().is_test(true).try_init();
    let dirs = vec![TempDir::new().unwrap(), TempDir::new().unwrap()];
    let top = Arc::new(FaultyStorage::open(dirs[0].path()));
    let branches = vec![
        (top.clone() as Arc<dyn Storage>, Permission::ReadWrite),
        (
            Arc::new(DiskStorage::open(dirs[1].path()).unwrap()) as Arc<dyn Storage>,
            Permission::ReadOnly,
        ),
    ];
    let union = Union::new(branches, UnionOptions::default()).unwrap();
    (dirs, top, union)
}
