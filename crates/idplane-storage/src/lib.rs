// Durable filesystem primitives shared by the control plane and the consensus log.
use std::path::PathBuf;
use thiserror::Error;

pub mod archive;
pub mod atomic;

pub use archive::{UnpackReport, pack, unpack_confined};
pub use atomic::{DEFAULT_FILE_MODE, atomic_write, read_optional};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid path: {}", .0.display())]
    InvalidPath(PathBuf),
    #[error("rename into {} failed: {source}", path.display())]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
