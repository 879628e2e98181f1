use thiserror::Error;

#[derive(Error, Debug)]
pub enum UnionError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("no writable branch can hold {0}")]
    ReadOnly(String),

    #[error("rename of {0} crosses branches")]
    CrossDevice(String),

    #[error("branch position {position} out of range (0..={len})")]
    InvalidPosition { position: usize, len: usize },

    #[error("storage already registered as a branch: {0}")]
    DuplicateStorage(String),

    #[error("cannot remove the last branch")]
    LastBranch,

    #[error("branch {0} is busy")]
    Busy(u64),

    #[error("invalid branch permutation: {0}")]
    InvalidPermutation(String),

    #[error("unknown branch id {0}")]
    UnknownBranch(u64),

    #[error("delete of {path} failed")]
    DeleteFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("rename to {path} failed")]
    RenameFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("copy of {path} failed")]
    CopyFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("copy-up of {path} failed")]
    CopyUpFailed {
        path: String,
        #[source]
        source: Box<UnionError>,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UnionError {
    /// Errno reported to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            UnionError::NotFound(_) => libc::ENOENT,
            UnionError::NotADirectory(_) => libc::ENOTDIR,
            UnionError::IsADirectory(_) => libc::EISDIR,
            UnionError::Exists(_) => libc::EEXIST,
            UnionError::NotEmpty(_) => libc::ENOTEMPTY,
            UnionError::InvalidName(_) => libc::EPERM,
            UnionError::ReadOnly(_) => libc::EROFS,
            UnionError::CrossDevice(_) => libc::EXDEV,
            UnionError::Busy(_) => libc::EBUSY,
            UnionError::LastBranch
            | UnionError::InvalidPosition { .. }
            | UnionError::DuplicateStorage(_)
            | UnionError::InvalidPermutation(_)
            | UnionError::UnknownBranch(_)
            | UnionError::Config(_)
            | UnionError::Json(_) => libc::EINVAL,
            UnionError::DeleteFailed { source, .. }
            | UnionError::RenameFailed { source, .. }
            | UnionError::CopyFailed { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            UnionError::CopyUpFailed { source, .. } => source.errno(),
            UnionError::Storage(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub(crate) fn copy_up_failed(path: &str, source: UnionError) -> Self {
        UnionError::CopyUpFailed {
            path: path.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, UnionError>;
