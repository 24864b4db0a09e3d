use thiserror::Error;

use crate::core::CoreError;

/// Storage layer error type covering both the KV/queue store and the
/// document store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Connecting to or talking to the KV store failed.
    #[error("store connection error: {0}")]
    Connection(String),

    /// A document store operation failed.
    #[error("database operation failed: {0}")]
    Database(String),

    /// A unique index rejected a write.
    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey {
        collection: &'static str,
        key: String,
    },

    /// A record conversion or codec error occurred.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// An I/O operation failed.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
