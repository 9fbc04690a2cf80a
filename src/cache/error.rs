use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the cache store
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache index error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No disk found for cache directory {0}")]
    DiskNotFound(PathBuf),

    #[error("Size limit of {requested} bytes does not fit in {available} bytes available for cache")]
    InsufficientDiskSpace { requested: u64, available: u64 },

    #[error("Invalid cache settings: {0}")]
    InvalidSettings(String),
}
