// ABOUTME: Persistent store adapter: bulk hydration reads and asynchronous tracked writes.
// ABOUTME: StoreRegistry makes open idempotent per (name, store id) within one owner.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::{BlobStore, BlobStoreHost, Entries, StoreError};
use crate::barrier::{TimeoutError, WriteBarrier};
use crate::tracker::{WriteObserver, WriteTracker};

/// Policy for concurrent writes to the same key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteOrdering {
    /// Each write to a key starts only after the previously issued write to
    /// that key has settled, so the last issued write is the last applied.
    #[default]
    PerKey,
    /// Writes start immediately; completion order between writes to the
    /// same key is unspecified. Callers must await each write to serialize.
    Unordered,
}

impl FromStr for WriteOrdering {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-key" => Ok(WriteOrdering::PerKey),
            "unordered" => Ok(WriteOrdering::Unordered),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for WriteOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOrdering::PerKey => f.write_str("per-key"),
            WriteOrdering::Unordered => f.write_str("unordered"),
        }
    }
}

/// Handle to one issued write. Awaiting it serializes the caller behind it.
pub struct WriteHandle {
    task: JoinHandle<Result<(), StoreError>>,
}

impl WriteHandle {
    pub async fn settled(self) -> Result<(), StoreError> {
        self.task.await?
    }
}

/// Last write issued for a key under [`WriteOrdering::PerKey`].
struct KeyTail {
    seq: u64,
    done: Option<oneshot::Receiver<()>>,
}

type Tails = Arc<Mutex<HashMap<Vec<u8>, KeyTail>>>;

/// Held by a per-key write while it runs. Dropping it releases the next
/// write to the same key and clears the tail if no successor exists.
struct KeyTicket {
    key: Vec<u8>,
    seq: u64,
    tails: Tails,
    _done: oneshot::Sender<()>,
}

impl Drop for KeyTicket {
    fn drop(&mut self) {
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        if tails.get(&self.key).is_some_and(|t| t.seq == self.seq) {
            tails.remove(&self.key);
        }
    }
}

/// Owns one durable blob store and its pending-write counter. All writes go
/// through [`PersistentStore::write`], which is the only place the counter moves.
pub struct PersistentStore {
    name: String,
    store_id: String,
    backend: Arc<dyn BlobStore>,
    tracker: Arc<WriteTracker>,
    ordering: WriteOrdering,
    tails: Tails,
    next_seq: AtomicU64,
    runtime: Handle,
}

impl PersistentStore {
    /// Wrap an opened backend. Writes are spawned on the current tokio runtime.
    pub fn new(
        name: &str,
        store_id: &str,
        backend: Arc<dyn BlobStore>,
        ordering: WriteOrdering,
    ) -> Result<Self, StoreError> {
        let runtime = Handle::try_current().map_err(|_| StoreError::NoRuntime)?;
        Ok(Self {
            name: name.to_string(),
            store_id: store_id.to_string(),
            backend,
            tracker: Arc::new(WriteTracker::new()),
            ordering,
            tails: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            runtime,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store_id(&self) -> &str {
        &self.store_id
    }

    pub fn ordering(&self) -> WriteOrdering {
        self.ordering
    }

    /// Read every persisted entry in one bulk operation.
    pub async fn load_all(&self) -> Result<Entries, StoreError> {
        let (keys, values) = self.backend.get_all_entries().await?;
        tracing::info!(
            "loaded {} entries from store {}/{}",
            keys.len(),
            self.name,
            self.store_id
        );
        Ok((keys, values))
    }

    /// Issue an asynchronous put (`Some`) or delete (`None`). The pending
    /// counter is incremented before this returns and decremented when the
    /// write settles, whatever its outcome.
    pub fn write(&self, key: Vec<u8>, value: Option<Vec<u8>>) -> WriteHandle {
        let guard = self.tracker.begin();
        let (previous, ticket) = match self.ordering {
            WriteOrdering::PerKey => self.enqueue(&key),
            WriteOrdering::Unordered => (None, None),
        };
        let backend = Arc::clone(&self.backend);

        let task = self.runtime.spawn(async move {
            let _guard = guard;
            let _ticket = ticket;
            if let Some(previous) = previous {
                // Err only means the predecessor's ticket was dropped, which is
                // exactly the release signal.
                let _ = previous.await;
            }

            let is_delete = value.is_none();
            let result = match value {
                Some(value) => backend.put(key.clone(), value).await,
                None => backend.delete(key.clone()).await,
            };
            if let Err(e) = &result {
                tracing::error!(
                    "store {} failed for key of {} bytes: {}",
                    if is_delete { "delete" } else { "put" },
                    key.len(),
                    e
                );
            }
            result
        });

        WriteHandle { task }
    }

    fn enqueue(&self, key: &[u8]) -> (Option<oneshot::Receiver<()>>, Option<KeyTicket>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done_tx, done_rx) = oneshot::channel();
        let mut tails = self.tails.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tails
            .insert(
                key.to_vec(),
                KeyTail {
                    seq,
                    done: Some(done_rx),
                },
            )
            .and_then(|mut tail| tail.done.take());

        let ticket = KeyTicket {
            key: key.to_vec(),
            seq,
            tails: Arc::clone(&self.tails),
            _done: done_tx,
        };
        (previous, Some(ticket))
    }

    /// Register a callback for every pending-write count change.
    pub fn register_observer(&self, observer: WriteObserver) {
        self.tracker.register_observer(observer);
    }

    pub fn pending_writes(&self) -> usize {
        self.tracker.pending()
    }

    pub fn barrier(&self) -> WriteBarrier {
        WriteBarrier::new(self.tracker.subscribe())
    }

    pub async fn flush_pending_writes(&self, timeout: Duration) -> Result<(), TimeoutError> {
        self.barrier().flush_pending_writes(timeout).await
    }
}

/// Caches one [`PersistentStore`] per `(name, store_id)` so that a second
/// open reuses the first adapter and its counter. Owned by whoever owns the
/// engine; there is no process-global registry.
pub struct StoreRegistry {
    host: Arc<dyn BlobStoreHost>,
    ordering: WriteOrdering,
    stores: tokio::sync::Mutex<HashMap<(String, String), Arc<PersistentStore>>>,
}

impl StoreRegistry {
    pub fn new(host: Arc<dyn BlobStoreHost>, ordering: WriteOrdering) -> Self {
        Self {
            host,
            ordering,
            stores: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Open a store, creating it in the host only on first use.
    pub async fn open(
        &self,
        name: &str,
        store_id: &str,
    ) -> Result<Arc<PersistentStore>, StoreError> {
        // Held across the host open so concurrent first opens converge.
        let mut stores = self.stores.lock().await;
        let key = (name.to_string(), store_id.to_string());
        if let Some(store) = stores.get(&key) {
            tracing::debug!("reusing open store {}/{}", name, store_id);
            return Ok(Arc::clone(store));
        }

        let backend = self.host.open(name, store_id).await?;
        let store = Arc::new(PersistentStore::new(name, store_id, backend, self.ordering)?);
        tracing::info!(
            "opened store {}/{} with {} write ordering",
            name,
            store_id,
            self.ordering
        );
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryHost;
    use crate::sqlite::SqliteHost;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;
    use tempfile::TempDir;

    async fn open_memory(
        host: Arc<MemoryHost>,
        ordering: WriteOrdering,
    ) -> Arc<PersistentStore> {
        StoreRegistry::new(host, ordering)
            .open("db", "kv")
            .await
            .unwrap()
    }

    async fn open_sqlite(root: &std::path::Path) -> Arc<PersistentStore> {
        StoreRegistry::new(
            Arc::new(SqliteHost::new(root.to_path_buf())),
            WriteOrdering::PerKey,
        )
        .open("main", "kv")
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn registry_open_is_idempotent() {
        let host = Arc::new(MemoryHost::new());
        let registry = StoreRegistry::new(
            Arc::clone(&host) as Arc<dyn BlobStoreHost>,
            WriteOrdering::PerKey,
        );

        let first = registry.open("db", "kv").await.unwrap();
        first.write(b"k".to_vec(), Some(b"v".to_vec())).settled().await.unwrap();
        let second = registry.open("db", "kv").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(host.open_count(), 1);
        let (keys, _) = second.load_all().await.unwrap();
        assert_eq!(keys, vec![b"k".to_vec()]);
    }

    #[tokio::test]
    async fn separate_registries_over_one_sqlite_file_see_same_entries() {
        let dir = TempDir::new().unwrap();

        let first = open_sqlite(dir.path()).await;
        first.write(b"a".to_vec(), Some(b"1".to_vec()));
        first.write(b"b".to_vec(), Some(b"2".to_vec()));
        first
            .flush_pending_writes(Duration::from_secs(5))
            .await
            .unwrap();

        let second = open_sqlite(dir.path()).await;
        let (keys, values) = second.load_all().await.unwrap();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(values, vec![b"1".to_vec(), b"2".to_vec()]);
    }

    #[tokio::test]
    async fn serialized_writes_leave_last_value_after_flush() {
        let host = Arc::new(MemoryHost::new().with_write_latency(Duration::from_millis(5)));
        let store = open_memory(Arc::clone(&host), WriteOrdering::Unordered).await;

        for i in 0..5u8 {
            store.write(b"k".to_vec(), Some(vec![i])).settled().await.unwrap();
        }
        store.write(b"gone".to_vec(), Some(b"x".to_vec())).settled().await.unwrap();
        store.write(b"gone".to_vec(), None).settled().await.unwrap();
        store
            .flush_pending_writes(Duration::from_secs(1))
            .await
            .unwrap();

        let (keys, values) = store.load_all().await.unwrap();
        assert_eq!(keys, vec![b"k".to_vec()]);
        assert_eq!(values, vec![vec![4u8]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_key_ordering_applies_last_issued_write() {
        let host = Arc::new(MemoryHost::new().with_write_latency(Duration::from_millis(2)));
        let store = open_memory(Arc::clone(&host), WriteOrdering::PerKey).await;

        // Issued without awaiting: the per-key chain still applies them in order.
        for i in 0..20u8 {
            store.write(b"k".to_vec(), Some(vec![i]));
        }
        store
            .flush_pending_writes(Duration::from_secs(5))
            .await
            .unwrap();

        let snapshot = host.snapshot("db", "kv").unwrap();
        assert_eq!(snapshot.get(b"k".as_slice()), Some(&vec![19u8]));
        assert!(store.tails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_writes_still_settle_the_counter() {
        let host = Arc::new(MemoryHost::new());
        let store = open_memory(Arc::clone(&host), WriteOrdering::PerKey).await;
        host.set_fail_writes(true);

        let result = store.write(b"k".to_vec(), Some(b"v".to_vec())).settled().await;
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert_eq!(store.pending_writes(), 0);
        store
            .flush_pending_writes(Duration::from_millis(50))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn observer_is_notified_on_issue_and_settle() {
        let host = Arc::new(MemoryHost::new());
        let store = open_memory(host, WriteOrdering::PerKey).await;
        let peak = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let (p, c) = (Arc::clone(&peak), Arc::clone(&calls));
        store.register_observer(Arc::new(move |n| {
            p.fetch_max(n, Ordering::SeqCst);
            c.fetch_add(1, Ordering::SeqCst);
        }));

        let a = store.write(b"a".to_vec(), Some(b"1".to_vec()));
        let b = store.write(b"b".to_vec(), Some(b"2".to_vec()));
        a.settled().await.unwrap();
        b.settled().await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn flush_times_out_before_slow_writes_settle() {
        let host = Arc::new(MemoryHost::new().with_write_latency(Duration::from_millis(200)));
        let store = open_memory(host, WriteOrdering::PerKey).await;

        for key in [b"a", b"b", b"c"] {
            store.write(key.to_vec(), Some(b"v".to_vec()));
        }

        let started = Instant::now();
        let err = store
            .flush_pending_writes(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert_eq!(err.pending, 3);
        assert_eq!(store.pending_writes(), 3);
    }

    #[test]
    fn write_ordering_parses_config_names() {
        assert_eq!("per-key".parse::<WriteOrdering>(), Ok(WriteOrdering::PerKey));
        assert_eq!("unordered".parse::<WriteOrdering>(), Ok(WriteOrdering::Unordered));
        assert!("fifo".parse::<WriteOrdering>().is_err());
    }
}
