// ABOUTME: In-process blob store host for tests and ephemeral deployments.
// ABOUTME: Supports injected write latency and injected write failures.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::backend::{BlobStore, BlobStoreHost, Entries, StoreError, validate_name};

type EntryMap = Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>>;

/// A blob store whose entries live in a map shared with its host, so every
/// open of the same name and store id sees the same data.
pub struct MemoryBlobStore {
    entries: EntryMap,
    write_latency: Duration,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBlobStore {
    async fn before_write(&self, key: &[u8]) -> Result<(), StoreError> {
        if !self.write_latency.is_zero() {
            tokio::time::sleep(self.write_latency).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(format!(
                "injected failure for key {}",
                String::from_utf8_lossy(key)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get_all_entries(&self) -> Result<Entries, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .unzip())
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.before_write(&key).await?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
        Ok(())
    }

    async fn delete(&self, key: Vec<u8>) -> Result<(), StoreError> {
        self.before_write(&key).await?;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }
}

/// Host handing out [`MemoryBlobStore`]s keyed by `(name, store_id)`.
#[derive(Default)]
pub struct MemoryHost {
    stores: Mutex<HashMap<(String, String), EntryMap>>,
    write_latency: Duration,
    fail_writes: Arc<AtomicBool>,
    opens: AtomicUsize,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every put and delete by `latency`.
    pub fn with_write_latency(mut self, latency: Duration) -> Self {
        self.write_latency = latency;
        self
    }

    /// Make every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of times `open` reached this host.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Copy of the current entries of a store, if it was ever opened.
    pub fn snapshot(&self, name: &str, store_id: &str) -> Option<BTreeMap<Vec<u8>, Vec<u8>>> {
        let stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        stores
            .get(&(name.to_string(), store_id.to_string()))
            .map(|map| map.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

#[async_trait]
impl BlobStoreHost for MemoryHost {
    async fn open(&self, name: &str, store_id: &str) -> Result<Arc<dyn BlobStore>, StoreError> {
        validate_name(name)?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        let entries = {
            let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                stores
                    .entry((name.to_string(), store_id.to_string()))
                    .or_default(),
            )
        };
        Ok(Arc::new(MemoryBlobStore {
            entries,
            write_latency: self.write_latency,
            fail_writes: Arc::clone(&self.fail_writes),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_of_same_store_share_entries() {
        let host = MemoryHost::new();
        let first = host.open("db", "kv").await.unwrap();
        first.put(b"k".to_vec(), b"v".to_vec()).await.unwrap();

        let second = host.open("db", "kv").await.unwrap();
        let (keys, values) = second.get_all_entries().await.unwrap();
        assert_eq!(keys, vec![b"k".to_vec()]);
        assert_eq!(values, vec![b"v".to_vec()]);
        assert_eq!(host.open_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_reject_writes() {
        let host = MemoryHost::new();
        let store = host.open("db", "kv").await.unwrap();
        host.set_fail_writes(true);

        let err = store.put(b"k".to_vec(), b"v".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
        assert!(host.snapshot("db", "kv").unwrap().is_empty());
    }
}
