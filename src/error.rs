use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("tag not found in repository: '{0}'")]
    TagNotFound(String),

    #[error("download failed for version '{version}': {reason}")]
    Download { version: String, reason: String },

    #[error("binary verification failed: {0}")]
    Verify(String),

    #[error("atomic symlink swap failed: {0}")]
    Swap(String),

    #[error("legacy migration failed: {0}")]
    Migration(String),

    #[error("failed to signal supervisor: {0}")]
    Signal(String),

    #[error("no backup symlinks found, cannot rollback")]
    NoBackups,

    #[error("ipc error: {0}")]
    Ipc(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
