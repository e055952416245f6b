// ABOUTME: The host-provided durable key-value surface the adapter persists through.
// ABOUTME: Defines the BlobStore and BlobStoreHost traits and the shared StoreError type.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// All keys and all values of a store, index-paired.
pub type Entries = (Vec<Vec<u8>>, Vec<Vec<u8>>);

/// Errors that can occur while opening, reading, or writing a blob store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid store name: {0:?}")]
    InvalidName(String),

    #[error("no tokio runtime available to drive store writes")]
    NoRuntime,

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("write rejected by store: {0}")]
    Rejected(String),
}

/// One named object store inside a host database.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read every entry in one bulk operation.
    async fn get_all_entries(&self) -> Result<Entries, StoreError>;

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError>;

    async fn delete(&self, key: Vec<u8>) -> Result<(), StoreError>;
}

/// Opens blob stores by database name and store id. Opening creates the
/// store only if it is absent; otherwise the existing entries are reused.
#[async_trait]
pub trait BlobStoreHost: Send + Sync {
    async fn open(&self, name: &str, store_id: &str) -> Result<Arc<dyn BlobStore>, StoreError>;
}

/// Database names become file names, so keep them to a single path segment.
pub(crate) fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.contains('\0');
    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}
