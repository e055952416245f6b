// ABOUTME: SQLite-backed blob store: one database file per store name, one row per entry.
// ABOUTME: Blocking rusqlite calls are moved onto tokio's blocking pool.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, params};

use crate::backend::{BlobStore, BlobStoreHost, Entries, StoreError, validate_name};

/// A blob store living in the `entries` table of a SQLite database,
/// partitioned by store id.
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
    store_id: String,
}

impl SqliteBlobStore {
    /// Open or create the database at `path`. The entries table is created
    /// only if it does not exist yet, so reopening keeps existing data.
    pub fn open(path: &Path, store_id: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS entries (
                store_id TEXT NOT NULL,
                key BLOB NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (store_id, key)
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            store_id: store_id.to_string(),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> Result<T, rusqlite::Error> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let store_id = self.store_id.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            Ok(f(&guard, &store_id)?)
        })
        .await?
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn get_all_entries(&self) -> Result<Entries, StoreError> {
        self.with_conn(|conn, store_id| {
            let mut stmt =
                conn.prepare("SELECT key, value FROM entries WHERE store_id = ?1 ORDER BY key")?;
            let rows = stmt.query_map(params![store_id], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut keys = Vec::new();
            let mut values = Vec::new();
            for row in rows {
                let (k, v) = row?;
                keys.push(k);
                values.push(v);
            }
            Ok((keys, values))
        })
        .await
    }

    async fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.with_conn(move |conn, store_id| {
            conn.execute(
                "INSERT INTO entries (store_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(store_id, key) DO UPDATE SET value = excluded.value",
                params![store_id, key, value],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: Vec<u8>) -> Result<(), StoreError> {
        self.with_conn(move |conn, store_id| {
            conn.execute(
                "DELETE FROM entries WHERE store_id = ?1 AND key = ?2",
                params![store_id, key],
            )?;
            Ok(())
        })
        .await
    }
}

/// Opens SQLite blob stores as `<root>/<name>.sqlite3`.
pub struct SqliteHost {
    root: PathBuf,
}

impl SqliteHost {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Path of the database file backing the given store name.
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.sqlite3", name))
    }
}

#[async_trait]
impl BlobStoreHost for SqliteHost {
    async fn open(&self, name: &str, store_id: &str) -> Result<Arc<dyn BlobStore>, StoreError> {
        validate_name(name)?;
        let path = self.database_path(name);
        let store_id = store_id.to_string();
        let store =
            tokio::task::spawn_blocking(move || SqliteBlobStore::open(&path, &store_id)).await??;
        tracing::debug!("opened sqlite blob store {}", name);
        Ok(Arc::new(store))
    }
}
