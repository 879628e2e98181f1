pub mod branch;
pub mod config;
pub mod copyup;
pub mod error;
pub mod fs;
pub mod fs_ctl;
mod fs_helpers;
pub mod handle;
pub mod inode;
pub mod lock;
pub mod path;
pub mod policy;
pub mod readdir;
pub mod resolve;
pub mod storage;
pub mod union;
pub mod whiteout;

pub use branch::{BranchId, BranchInfo, BranchOp, Permission};
pub use config::UnionConfig;
pub use error::{Result, UnionError};
pub use union::{Union, UnionOptions};
