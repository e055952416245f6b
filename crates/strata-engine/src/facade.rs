// ABOUTME: Engine facade: lazily hydrates the engine from the persistent store and bootstraps the schema.
// ABOUTME: Exposes raw scripts, schema-driven put/get/remove, chunked batch puts, and the write barrier.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::outcome::{parse_export_response, parse_import_response, parse_query_response};
use strata_core::{
    CommandError, CommandFactory, Condition, Engine, EngineError, EngineFactory, EngineFailure,
    ExportOutcome, HydrateError, ImportOutcome, Outcome, QueryOutcome, SchemaCatalog, Value,
    WriteSink,
};
use strata_store::{PersistentStore, StoreError, StoreRegistry, TimeoutError, WriteObserver};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::bootstrap::{SchemaError, load_catalog};
use crate::config::BridgeConfig;

/// Errors returned by the facade. Engine-reported query failures are not
/// errors; they come back as [`Outcome::Failed`].
#[derive(Debug, Error)]
pub enum FacadeError {
    #[error("engine facade is not initialized")]
    NotInitialized,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Hydrate(#[from] HydrateError),

    #[error("schema bootstrap failed: {0}")]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("invalid command: {0}")]
    Command(#[from] CommandError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("batch size must be greater than zero")]
    InvalidBatchSize,
}

/// Result of a chunked batch put. `failure` holds the engine's report for
/// the chunk that stopped the batch, if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub chunks: usize,
    pub rows_written: usize,
    pub failure: Option<EngineFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

struct Ready {
    engine: Arc<dyn Engine>,
    store: Arc<PersistentStore>,
    catalog: SchemaCatalog,
}

/// Single entry point to the engine. Nothing but `init` works until `init`
/// has succeeded once.
pub struct EngineFacade {
    registry: Arc<StoreRegistry>,
    factory: Arc<dyn EngineFactory>,
    store_name: String,
    store_id: String,
    init_script: String,
    flush_timeout: Duration,
    observer_registered: AtomicBool,
    ready: OnceCell<Ready>,
}

impl EngineFacade {
    pub fn new(
        config: &BridgeConfig,
        registry: Arc<StoreRegistry>,
        factory: Arc<dyn EngineFactory>,
        init_script: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            factory,
            store_name: config.store_name.clone(),
            store_id: config.store_id.clone(),
            init_script: init_script.into(),
            flush_timeout: config.flush_timeout,
            observer_registered: AtomicBool::new(false),
            ready: OnceCell::new(),
        }
    }

    /// Open the store, hydrate the engine from it and bootstrap the schema
    /// catalog. Concurrent callers share one initialization; once it has
    /// succeeded later calls return immediately. A failed attempt leaves the
    /// facade uninitialized so `init` can be retried.
    pub async fn init(&self, observer: Option<WriteObserver>) -> Result<(), FacadeError> {
        self.ready.get_or_try_init(|| self.initialize(observer)).await?;
        Ok(())
    }

    async fn initialize(&self, observer: Option<WriteObserver>) -> Result<Ready, FacadeError> {
        let store = self.registry.open(&self.store_name, &self.store_id).await?;

        // A retried init reuses the cached store, which already has the
        // first attempt's observer.
        if let Some(observer) = observer
            && !self.observer_registered.swap(true, Ordering::SeqCst)
        {
            store.register_observer(observer);
        }

        let (keys, values) = store.load_all().await?;
        let entries = keys.len();

        let sink_store = Arc::clone(&store);
        let sink: WriteSink = Arc::new(move |key, value| {
            sink_store.write(key, value);
        });
        let engine = self.factory.hydrate(keys, values, sink)?;
        tracing::info!("engine hydrated from {} entries", entries);

        let catalog = load_catalog(engine.as_ref(), &self.init_script)?;
        Ok(Ready {
            engine,
            store,
            catalog,
        })
    }

    /// Configured bound for draining writes at shutdown.
    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    pub fn is_ready(&self) -> bool {
        self.ready.initialized()
    }

    fn ready(&self) -> Result<&Ready, FacadeError> {
        self.ready.get().ok_or(FacadeError::NotInitialized)
    }

    /// The schema catalog built at init.
    pub fn catalog(&self) -> Result<&SchemaCatalog, FacadeError> {
        Ok(&self.ready()?.catalog)
    }

    /// Writes issued to the store that have not settled yet.
    pub fn write_count(&self) -> usize {
        self.ready.get().map_or(0, |r| r.store.pending_writes())
    }

    /// Run a raw script. An `ok:false` engine response is returned as
    /// [`Outcome::Failed`].
    pub fn run_command(&self, script: &str, read_only: bool) -> Result<QueryOutcome, FacadeError> {
        run(self.ready()?, script, "{}", read_only)
    }

    pub fn run_command_with_params(
        &self,
        script: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        read_only: bool,
    ) -> Result<QueryOutcome, FacadeError> {
        let params = serde_json::Value::Object(params.clone()).to_string();
        run(self.ready()?, script, &params, read_only)
    }

    /// Upsert rows, each in the table's column order (keys then values).
    pub fn put(&self, table: &str, rows: &[Vec<Value>]) -> Result<QueryOutcome, FacadeError> {
        let ready = self.ready()?;
        let command = CommandFactory::new(&ready.catalog).put(table, rows)?;
        run(ready, command.script(), "{}", false)
    }

    /// Read every column of `table` for rows matching all conditions.
    pub fn get(&self, table: &str, conditions: &[Condition]) -> Result<QueryOutcome, FacadeError> {
        let ready = self.ready()?;
        let command = CommandFactory::new(&ready.catalog).get(table, conditions)?;
        run(ready, command.script(), "{}", true)
    }

    /// Delete rows by key; each entry of `keys` holds the key columns only.
    pub fn remove(&self, table: &str, keys: &[Vec<Value>]) -> Result<QueryOutcome, FacadeError> {
        let ready = self.ready()?;
        let command = CommandFactory::new(&ready.catalog).remove(table, keys)?;
        run(ready, command.script(), "{}", false)
    }

    /// Put `rows` in sequential chunks of `batch_size`, each committed before
    /// the next starts. `on_progress` receives the cumulative row count after
    /// every committed chunk. The first failing chunk stops the batch; rows
    /// of earlier chunks stay committed.
    pub async fn execute_batch_put_command(
        &self,
        table: &str,
        rows: &[Vec<Value>],
        batch_size: usize,
        mut on_progress: impl FnMut(usize) + Send,
    ) -> Result<BatchReport, FacadeError> {
        if batch_size == 0 {
            return Err(FacadeError::InvalidBatchSize);
        }
        let ready = self.ready()?;

        // Every row is validated before the first chunk is committed; each
        // chunk's script is rendered only when its turn comes.
        let factory = CommandFactory::new(&ready.catalog);
        factory.validate_rows(table, rows)?;

        let mut report = BatchReport::default();
        for chunk in rows.chunks(batch_size) {
            let command = factory.put(table, chunk)?;
            match run(ready, command.script(), "{}", false)? {
                Outcome::Ok(_) => {
                    report.chunks += 1;
                    report.rows_written += chunk.len();
                    tracing::debug!(
                        "batch put into {}: chunk {} committed, {} rows so far",
                        table,
                        report.chunks,
                        report.rows_written
                    );
                    on_progress(report.rows_written);
                }
                Outcome::Failed(failure) => {
                    tracing::warn!(
                        "batch put into {} stopped after {} rows: {}",
                        table,
                        report.rows_written,
                        failure.message
                    );
                    report.failure = Some(failure);
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
        Ok(report)
    }

    /// Wait until every write issued so far has settled.
    pub async fn flush_pending_writes(&self, timeout: Duration) -> Result<(), FacadeError> {
        let ready = self.ready()?;
        ready.store.flush_pending_writes(timeout).await?;
        Ok(())
    }

    /// Export the named relations as `{name: {headers, rows}}`.
    pub fn export_relations<S: AsRef<str>>(
        &self,
        relations: &[S],
    ) -> Result<ExportOutcome, FacadeError> {
        let names: Vec<&str> = relations.iter().map(AsRef::as_ref).collect();
        let raw = self.ready()?.engine.export(&names.join(","));
        Ok(parse_export_response(&raw)?)
    }

    /// Import data shaped like an export. Engine triggers do not fire for
    /// imported rows.
    pub fn import_relations(&self, data: &serde_json::Value) -> Result<ImportOutcome, FacadeError> {
        let raw = self.ready()?.engine.import(&data.to_string());
        Ok(parse_import_response(&raw)?)
    }
}

fn run(
    ready: &Ready,
    script: &str,
    params: &str,
    read_only: bool,
) -> Result<QueryOutcome, FacadeError> {
    tracing::debug!("running script (read_only={}): {}", read_only, script);
    let outcome = parse_query_response(&ready.engine.run(script, params, read_only))?;
    if let Outcome::Failed(failure) = &outcome {
        tracing::debug!("engine reported failure: {}", failure.message);
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ReferenceEngineFactory;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use strata_core::{CompareOp, NamedRows};
    use strata_store::{BlobStoreHost, MemoryHost, SqliteHost, WriteOrdering};
    use tempfile::TempDir;

    const INIT: &str = "{:create t1 {id: Int => name: String}}\n{:create tags {tag: String}}";

    fn config() -> BridgeConfig {
        BridgeConfig {
            store_name: "app".to_string(),
            store_id: "kv".to_string(),
            ..BridgeConfig::default()
        }
    }

    fn facade_over(host: Arc<dyn BlobStoreHost>, factory: Arc<dyn EngineFactory>) -> EngineFacade {
        let registry = Arc::new(StoreRegistry::new(host, WriteOrdering::PerKey));
        EngineFacade::new(&config(), registry, factory, INIT)
    }

    async fn ready_facade() -> EngineFacade {
        let facade = facade_over(
            Arc::new(MemoryHost::new()),
            Arc::new(ReferenceEngineFactory::new()),
        );
        facade.init(None).await.unwrap();
        facade
    }

    fn rows_of(outcome: QueryOutcome) -> NamedRows {
        match outcome {
            Outcome::Ok(rows) => rows,
            Outcome::Failed(f) => panic!("engine failure: {}", f.message),
        }
    }

    fn as_set(rows: &NamedRows) -> BTreeSet<String> {
        rows.rows.iter().map(|r| json!(r).to_string()).collect()
    }

    fn people(n: i64) -> Vec<Vec<Value>> {
        (0..n)
            .map(|i| vec![Value::Int(i), Value::from(format!("n{}", i))])
            .collect()
    }

    #[tokio::test]
    async fn put_then_get_returns_the_rows() {
        let facade = ready_facade().await;
        let rows = vec![
            vec![Value::Int(1), Value::from("a")],
            vec![Value::Int(2), Value::from("b")],
        ];

        assert!(facade.put("t1", &rows).unwrap().is_ok());
        let got = rows_of(facade.get("t1", &[]).unwrap());

        assert_eq!(got.headers, ["id", "name"]);
        assert_eq!(
            as_set(&got),
            BTreeSet::from([json!([1, "a"]).to_string(), json!([2, "b"]).to_string()])
        );
    }

    #[tokio::test]
    async fn get_applies_conditions_and_remove_deletes() {
        let facade = ready_facade().await;
        facade.put("t1", &people(5)).unwrap();

        let got = rows_of(
            facade
                .get("t1", &[Condition::compare("id", CompareOp::Ge, 3)])
                .unwrap(),
        );
        assert_eq!(got.len(), 2);

        facade
            .remove("t1", &[vec![Value::Int(0)], vec![Value::Int(1)]])
            .unwrap();
        let got = rows_of(facade.get("t1", &[Condition::raw("id < 2")]).unwrap());
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn operations_before_init_fail() {
        let facade = facade_over(
            Arc::new(MemoryHost::new()),
            Arc::new(ReferenceEngineFactory::new()),
        );
        assert!(!facade.is_ready());
        assert!(matches!(
            facade.put("t1", &people(1)),
            Err(FacadeError::NotInitialized)
        ));
        assert!(matches!(
            facade.run_command("::relations", true),
            Err(FacadeError::NotInitialized)
        ));
        assert_eq!(facade.write_count(), 0);
    }

    #[tokio::test]
    async fn engine_failure_is_data_not_error() {
        let facade = ready_facade().await;
        let outcome = facade.run_command("?[a] := *missing{a}", true).unwrap();
        let failure = outcome.failure().unwrap();
        assert!(failure.message.contains("missing"));
        assert_eq!(failure.severity.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn params_must_be_passed_as_a_map() {
        let facade = ready_facade().await;
        let mut params = serde_json::Map::new();
        params.insert("x".to_string(), json!(1));
        let outcome = facade
            .run_command_with_params("?[id, name] := *t1{id, name}", &params, true)
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn unknown_table_is_a_command_error() {
        let facade = ready_facade().await;
        assert!(matches!(
            facade.put("nope", &people(1)),
            Err(FacadeError::Command(CommandError::UnknownTable(_)))
        ));
    }

    #[tokio::test]
    async fn batch_put_reports_progress_per_chunk() {
        let facade = ready_facade().await;
        let mut progress = Vec::new();

        let report = facade
            .execute_batch_put_command("t1", &people(2500), 1000, |n| progress.push(n))
            .await
            .unwrap();

        assert_eq!(report.chunks, 3);
        assert_eq!(report.rows_written, 2500);
        assert!(report.is_complete());
        assert_eq!(progress, vec![1000, 2000, 2500]);
        assert_eq!(rows_of(facade.get("t1", &[]).unwrap()).len(), 2500);
    }

    #[tokio::test]
    async fn batch_size_zero_is_rejected() {
        let facade = ready_facade().await;
        let err = facade
            .execute_batch_put_command("t1", &people(3), 0, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, FacadeError::InvalidBatchSize));
    }

    #[tokio::test]
    async fn invalid_row_commits_nothing() {
        let facade = ready_facade().await;
        let mut rows = people(10);
        rows[7] = vec![Value::from("not an int"), Value::from("x")];

        let err = facade
            .execute_batch_put_command("t1", &rows, 3, |_| {})
            .await
            .unwrap_err();
        // Rows are checked as one sequence before any chunk is rendered.
        assert!(matches!(
            err,
            FacadeError::Command(CommandError::TypeMismatch { row: 7, .. })
        ));
        assert!(rows_of(facade.get("t1", &[]).unwrap()).is_empty());
    }

    /// Passes calls through, but rejects puts once `allowed_puts` have run.
    struct RationedEngine {
        inner: Arc<dyn Engine>,
        allowed_puts: AtomicUsize,
    }

    impl Engine for RationedEngine {
        fn run(&self, script: &str, params: &str, read_only: bool) -> String {
            let is_put = script.contains("\n:put ");
            if is_put
                && self
                    .allowed_puts
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_err()
            {
                return json!({"ok": false, "message": "disk full"}).to_string();
            }
            self.inner.run(script, params, read_only)
        }

        fn export(&self, relations_csv: &str) -> String {
            self.inner.export(relations_csv)
        }

        fn import(&self, data: &str) -> String {
            self.inner.import(data)
        }
    }

    struct RationedFactory(usize);

    impl EngineFactory for RationedFactory {
        fn hydrate(
            &self,
            keys: Vec<Vec<u8>>,
            values: Vec<Vec<u8>>,
            sink: WriteSink,
        ) -> Result<Arc<dyn Engine>, HydrateError> {
            let inner = ReferenceEngineFactory::new().hydrate(keys, values, sink)?;
            Ok(Arc::new(RationedEngine {
                inner,
                allowed_puts: AtomicUsize::new(self.0),
            }))
        }
    }

    #[tokio::test]
    async fn failing_chunk_aborts_the_rest() {
        let facade = facade_over(Arc::new(MemoryHost::new()), Arc::new(RationedFactory(1)));
        facade.init(None).await.unwrap();
        let mut progress = Vec::new();

        let report = facade
            .execute_batch_put_command("t1", &people(10), 4, |n| progress.push(n))
            .await
            .unwrap();

        assert_eq!(report.chunks, 1);
        assert_eq!(report.rows_written, 4);
        assert_eq!(report.failure.unwrap().message, "disk full");
        assert_eq!(progress, vec![4]);
        assert_eq!(rows_of(facade.get("t1", &[]).unwrap()).len(), 4);
    }

    #[tokio::test]
    async fn concurrent_init_hydrates_once() {
        let factory = Arc::new(ReferenceEngineFactory::new());
        let facade = facade_over(Arc::new(MemoryHost::new()), factory.clone());

        let results = futures::future::join_all((0..8).map(|_| facade.init(None))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(factory.hydrations(), 1);
        facade.init(None).await.unwrap();
        assert_eq!(factory.hydrations(), 1);
    }

    #[tokio::test]
    async fn failed_init_can_be_retried() {
        let host = Arc::new(MemoryHost::new());
        let registry = Arc::new(StoreRegistry::new(host, WriteOrdering::PerKey));
        let store = registry.open("app", "kv").await.unwrap();
        store
            .write(b"junk".to_vec(), Some(b"x".to_vec()))
            .settled()
            .await
            .unwrap();

        let facade = EngineFacade::new(
            &config(),
            Arc::clone(&registry),
            Arc::new(ReferenceEngineFactory::new()),
            INIT,
        );
        assert!(matches!(
            facade.init(None).await,
            Err(FacadeError::Hydrate(_))
        ));
        assert!(!facade.is_ready());

        store.write(b"junk".to_vec(), None).settled().await.unwrap();
        facade.init(None).await.unwrap();
        assert!(facade.catalog().unwrap().get("t1").is_some());
    }

    #[tokio::test]
    async fn observer_sees_writes_rise_and_settle() {
        let facade = facade_over(
            Arc::new(MemoryHost::new()),
            Arc::new(ReferenceEngineFactory::new()),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        facade
            .init(Some(Arc::new(move |n| log.lock().unwrap().push(n))))
            .await
            .unwrap();

        facade.put("t1", &people(3)).unwrap();
        facade
            .flush_pending_writes(Duration::from_secs(2))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.iter().any(|n| *n > 0));
        assert_eq!(seen.last(), Some(&0));
        assert_eq!(facade.write_count(), 0);
    }

    #[tokio::test]
    async fn state_survives_reopen_through_sqlite() {
        let dir = TempDir::new().unwrap();
        let open = || {
            facade_over(
                Arc::new(SqliteHost::new(dir.path().to_path_buf())),
                Arc::new(ReferenceEngineFactory::new()),
            )
        };

        let first = open();
        first.init(None).await.unwrap();
        first.put("t1", &people(3)).unwrap();
        first.remove("t1", &[vec![Value::Int(1)]]).unwrap();
        first
            .flush_pending_writes(Duration::from_secs(5))
            .await
            .unwrap();

        let second = open();
        second.init(None).await.unwrap();
        let got = rows_of(second.get("t1", &[]).unwrap());
        assert_eq!(
            as_set(&got),
            BTreeSet::from([json!([0, "n0"]).to_string(), json!([2, "n2"]).to_string()])
        );
        assert_eq!(first.catalog().unwrap(), second.catalog().unwrap());
    }

    #[tokio::test]
    async fn export_then_import_copies_rows() {
        let source = ready_facade().await;
        source.put("t1", &people(4)).unwrap();
        let exported = match source.export_relations(&["t1"]).unwrap() {
            Outcome::Ok(data) => data,
            Outcome::Failed(f) => panic!("export failed: {}", f.message),
        };

        let target = ready_facade().await;
        let imported = target
            .import_relations(&serde_json::to_value(&exported).unwrap())
            .unwrap();
        assert!(imported.is_ok());
        assert_eq!(
            as_set(&rows_of(target.get("t1", &[]).unwrap())),
            as_set(&exported["t1"])
        );
    }
}
