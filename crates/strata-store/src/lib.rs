// ABOUTME: Persistence layer for strata, bridging the engine's raw writes to a durable blob store.
// ABOUTME: Provides the store adapter, pending-write tracking, the write barrier, and store backends.

pub mod adapter;
pub mod backend;
pub mod barrier;
pub mod memory;
pub mod sqlite;
pub mod tracker;

pub use adapter::{PersistentStore, StoreRegistry, WriteHandle, WriteOrdering};
pub use backend::{BlobStore, BlobStoreHost, Entries, StoreError};
pub use barrier::{TimeoutError, WriteBarrier};
pub use memory::{MemoryBlobStore, MemoryHost};
pub use sqlite::{SqliteBlobStore, SqliteHost};
pub use tracker::{PendingWrite, WriteObserver, WriteTracker};
