// ABOUTME: Caller-side handle to the engine worker: correlates responses and routes notifications.
// ABOUTME: Progress closures stay on the caller side; only their callback ids cross the boundary.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use strata_core::{Condition, ExportOutcome, ImportOutcome, QueryOutcome, Value};
use strata_engine::{BatchReport, EngineFacade};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::protocol::{
    Call, Notification, RemoteError, Reply, Request, Response, ResponseBody, WorkerMessage,
};
use crate::worker;

const REQUEST_BUFFER: usize = 64;

/// Errors seen by callers of the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("worker transport failed: {0}")]
    Transport(String),

    #[error("worker thread could not be started: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("worker answered {method} with a {got} reply")]
    UnexpectedReply { method: &'static str, got: &'static str },
}

type ProgressCallback = Box<dyn FnMut(usize) + Send>;
type SharedCallback = Arc<Mutex<ProgressCallback>>;

struct Pending {
    reply: oneshot::Sender<Result<Reply, ProxyError>>,
    callback: Option<u64>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Pending>>,
    callbacks: Mutex<HashMap<u64, SharedCallback>>,
    closed: AtomicBool,
}

impl Shared {
    fn take_pending(&self, call_id: u64) -> Option<Pending> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&call_id)?;
        if let Some(callback_id) = pending.callback {
            self.callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&callback_id);
        }
        Some(pending)
    }

    /// Fail the call that registered `callback_id`, if it is still waiting.
    fn fail_callback_owner(&self, callback_id: u64, reason: &str) {
        let call_id = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|(_, pending)| pending.callback == Some(callback_id))
            .map(|(call_id, _)| *call_id);
        if let Some(pending) = call_id.and_then(|call_id| self.take_pending(call_id)) {
            let _ = pending.reply.send(Err(ProxyError::Transport(reason.to_string())));
        }
    }

    /// Refuse new calls and fail every call still waiting for a reply.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let stranded: Vec<Pending> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        if !stranded.is_empty() {
            tracing::warn!("worker channel closed with {} calls pending", stranded.len());
        }
        for pending in stranded {
            let _ = pending
                .reply
                .send(Err(ProxyError::Transport("worker channel closed".to_string())));
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Drops a call's pending entry and progress callback when its future ends,
/// whether it completed or was abandoned mid-flight.
struct CallGuard<'a> {
    shared: &'a Shared,
    call_id: u64,
    callback: Option<u64>,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.call_id);
        if let Some(callback_id) = self.callback {
            self.shared
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&callback_id);
        }
    }
}

/// Runs the router's teardown even if the router task unwinds.
struct CloseOnExit(Arc<Shared>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The caller's view of the engine facade. Every method sends one request
/// to the worker and awaits its response; the engine never runs on the
/// caller's thread.
pub struct ProxyHandle {
    requests: mpsc::Sender<Request>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    write_count: watch::Receiver<usize>,
    worker: Option<thread::JoinHandle<()>>,
    router: JoinHandle<()>,
}

impl ProxyHandle {
    /// Move `facade` onto a fresh worker thread. Must be called from within
    /// a tokio runtime, which hosts the response router.
    pub fn spawn(facade: EngineFacade) -> Result<Self, ProxyError> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_BUFFER);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let worker = worker::spawn(facade, request_rx, outbound_tx)?;
        Ok(Self::from_channels(request_tx, outbound_rx, Some(worker)))
    }

    fn from_channels(
        requests: mpsc::Sender<Request>,
        inbound: mpsc::UnboundedReceiver<WorkerMessage>,
        worker: Option<thread::JoinHandle<()>>,
    ) -> Self {
        let shared = Arc::new(Shared::default());
        let (count_tx, count_rx) = watch::channel(0);
        let router = tokio::spawn(route(inbound, Arc::clone(&shared), count_tx));
        Self {
            requests,
            shared,
            next_id: AtomicU64::new(1),
            write_count: count_rx,
            worker,
            router,
        }
    }

    /// Latest pending-write count reported by the worker.
    pub fn write_count(&self) -> watch::Receiver<usize> {
        self.write_count.clone()
    }

    async fn call(
        &self,
        call: Call,
        progress: Option<ProgressCallback>,
    ) -> Result<Reply, ProxyError> {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        let callback = progress.map(|cb| {
            let callback_id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.shared
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(callback_id, Arc::new(Mutex::new(cb)));
            callback_id
        });
        let _guard = CallGuard {
            shared: &self.shared,
            call_id,
            callback,
        };
        let call = match (call, callback) {
            (Call::ExecuteBatchPutCommand { table, rows, batch_size, .. }, Some(id)) => {
                Call::ExecuteBatchPutCommand {
                    table,
                    rows,
                    batch_size,
                    progress: Some(id),
                }
            }
            (call, _) => call,
        };

        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call_id, Pending { reply: reply_tx, callback });
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ProxyError::Transport("worker channel closed".to_string()));
        }

        if self.requests.send(Request { call_id, call }).await.is_err() {
            return Err(ProxyError::Transport("worker is not accepting requests".to_string()));
        }

        reply_rx
            .await
            .map_err(|_| ProxyError::Transport("worker dropped the call".to_string()))?
    }

    pub async fn init(&self) -> Result<(), ProxyError> {
        match self.call(Call::Init, None).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected("init", &other)),
        }
    }

    pub async fn run_command(
        &self,
        script: &str,
        read_only: bool,
    ) -> Result<QueryOutcome, ProxyError> {
        let call = Call::RunCommand {
            script: script.to_string(),
            params: None,
            read_only,
        };
        self.query("runCommand", call).await
    }

    pub async fn run_command_with_params(
        &self,
        script: &str,
        params: serde_json::Map<String, serde_json::Value>,
        read_only: bool,
    ) -> Result<QueryOutcome, ProxyError> {
        let call = Call::RunCommand {
            script: script.to_string(),
            params: Some(params),
            read_only,
        };
        self.query("runCommand", call).await
    }

    pub async fn put(
        &self,
        table: &str,
        rows: Vec<Vec<Value>>,
    ) -> Result<QueryOutcome, ProxyError> {
        let call = Call::Put {
            table: table.to_string(),
            rows,
        };
        self.query("put", call).await
    }

    pub async fn get(
        &self,
        table: &str,
        conditions: Vec<Condition>,
    ) -> Result<QueryOutcome, ProxyError> {
        let call = Call::Get {
            table: table.to_string(),
            conditions,
        };
        self.query("get", call).await
    }

    pub async fn remove(
        &self,
        table: &str,
        keys: Vec<Vec<Value>>,
    ) -> Result<QueryOutcome, ProxyError> {
        let call = Call::Remove {
            table: table.to_string(),
            keys,
        };
        self.query("remove", call).await
    }

    async fn query(&self, method: &'static str, call: Call) -> Result<QueryOutcome, ProxyError> {
        match self.call(call, None).await? {
            Reply::Query(outcome) => Ok(outcome),
            other => Err(unexpected(method, &other)),
        }
    }

    /// Batch put on the worker. `on_progress` runs on the caller side with
    /// the cumulative row count after each committed chunk. If it panics,
    /// this call fails with `ProxyError::Transport` and the proxy stays usable.
    pub async fn execute_batch_put_command(
        &self,
        table: &str,
        rows: Vec<Vec<Value>>,
        batch_size: usize,
        on_progress: impl FnMut(usize) + Send + 'static,
    ) -> Result<BatchReport, ProxyError> {
        let call = Call::ExecuteBatchPutCommand {
            table: table.to_string(),
            rows,
            batch_size,
            progress: None,
        };
        match self.call(call, Some(Box::new(on_progress))).await? {
            Reply::Batch(report) => Ok(report),
            other => Err(unexpected("executeBatchPutCommand", &other)),
        }
    }

    pub async fn flush_pending_writes(&self, timeout: Duration) -> Result<(), ProxyError> {
        let call = Call::FlushPendingWrites {
            // Rounded up so a sub-millisecond timeout never becomes zero.
            timeout_ms: u64::try_from(timeout.as_nanos().div_ceil(1_000_000))
                .unwrap_or(u64::MAX),
        };
        match self.call(call, None).await? {
            Reply::Done => Ok(()),
            other => Err(unexpected("flushPendingWrites", &other)),
        }
    }

    pub async fn export_relations(
        &self,
        relations: Vec<String>,
    ) -> Result<ExportOutcome, ProxyError> {
        match self.call(Call::ExportRelations { relations }, None).await? {
            Reply::Export(outcome) => Ok(outcome),
            other => Err(unexpected("exportRelations", &other)),
        }
    }

    pub async fn import_relations(
        &self,
        data: serde_json::Value,
    ) -> Result<ImportOutcome, ProxyError> {
        match self.call(Call::ImportRelations { data }, None).await? {
            Reply::Import(outcome) => Ok(outcome),
            other => Err(unexpected("importRelations", &other)),
        }
    }

    /// Stop accepting requests, let the worker answer what it already has,
    /// and wait for its thread to exit.
    pub async fn shutdown(self) -> Result<(), ProxyError> {
        let ProxyHandle {
            requests,
            worker,
            router,
            ..
        } = self;
        drop(requests);

        if let Some(worker) = worker {
            let joined = tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| ProxyError::Transport(e.to_string()))?;
            if joined.is_err() {
                return Err(ProxyError::Transport("worker thread panicked".to_string()));
            }
        }
        router
            .await
            .map_err(|e| ProxyError::Transport(e.to_string()))?;
        tracing::info!("proxy shut down");
        Ok(())
    }
}

fn unexpected(method: &'static str, reply: &Reply) -> ProxyError {
    ProxyError::UnexpectedReply {
        method,
        got: reply.kind(),
    }
}

/// Deliver worker messages until the worker's side of the channel closes,
/// then fail whatever is still waiting.
async fn route(
    mut inbound: mpsc::UnboundedReceiver<WorkerMessage>,
    shared: Arc<Shared>,
    counts: watch::Sender<usize>,
) {
    let _close = CloseOnExit(Arc::clone(&shared));
    while let Some(message) = inbound.recv().await {
        match message {
            WorkerMessage::Notification(Notification::WritesCountUpdate { value }) => {
                counts.send_replace(value);
            }
            WorkerMessage::Notification(Notification::Progress {
                callback_id,
                written,
            }) => {
                let callback = shared
                    .callbacks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&callback_id)
                    .cloned();
                let Some(callback) = callback else {
                    tracing::debug!("progress for released callback {}", callback_id);
                    continue;
                };
                let delivered = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                    (&mut *callback)(written)
                }));
                if delivered.is_err() {
                    tracing::error!("progress callback {} panicked", callback_id);
                    shared.fail_callback_owner(callback_id, "progress callback panicked");
                }
            }
            WorkerMessage::Response(Response { call_id, body }) => {
                let result = match body {
                    ResponseBody::Result(reply) => Ok(reply),
                    ResponseBody::Error(err) => Err(ProxyError::Remote(err)),
                };
                match shared.take_pending(call_id) {
                    Some(pending) => {
                        let _ = pending.reply.send(result);
                    }
                    None => tracing::debug!("response for abandoned call {}", call_id),
                }
            }
        }
    }
}
