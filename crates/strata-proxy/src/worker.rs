// ABOUTME: The isolated worker: owns the engine facade on its own OS thread and tokio runtime.
// ABOUTME: Routes each request to a per-method lane so same-method calls complete in call order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use strata_engine::{EngineFacade, FacadeError};
use strata_store::WriteObserver;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::protocol::{
    Call, Notification, RemoteError, Reply, Request, Response, ResponseBody, WorkerMessage,
};

pub(crate) type Outbound = mpsc::UnboundedSender<WorkerMessage>;

/// Start the worker thread. It runs until every request sender is dropped
/// and all accepted requests have been answered.
pub(crate) fn spawn(
    facade: EngineFacade,
    requests: mpsc::Receiver<Request>,
    outbound: Outbound,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("strata-worker".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::error!("failed to build worker runtime: {}", e);
                    return;
                }
            };
            runtime.block_on(serve(Arc::new(facade), requests, outbound));
        })
}

async fn serve(
    facade: Arc<EngineFacade>,
    mut requests: mpsc::Receiver<Request>,
    outbound: Outbound,
) {
    tracing::info!("engine worker started");
    let mut lanes: HashMap<&'static str, mpsc::UnboundedSender<Request>> = HashMap::new();
    let mut tasks = JoinSet::new();

    while let Some(request) = requests.recv().await {
        let method = request.call.method();
        let lane = lanes.entry(method).or_insert_with(|| {
            tracing::debug!("opening lane for {}", method);
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.spawn(run_lane(Arc::clone(&facade), rx, outbound.clone()));
            tx
        });
        if lane.send(request).is_err() {
            tracing::error!("lane for {} is gone, dropping request", method);
        }
    }

    // Closing the lanes lets each drain what it already accepted.
    drop(lanes);
    while tasks.join_next().await.is_some() {}

    // Write tasks die with this runtime, so drain them first.
    if facade.is_ready()
        && let Err(e) = facade.flush_pending_writes(facade.flush_timeout()).await
    {
        tracing::warn!("stopping with unsettled writes: {}", e);
    }
    tracing::info!("engine worker stopped");
}

async fn run_lane(
    facade: Arc<EngineFacade>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    outbound: Outbound,
) {
    while let Some(Request { call_id, call }) = requests.recv().await {
        let method = call.method();
        let body = match dispatch(&facade, call, &outbound).await {
            Ok(reply) => ResponseBody::Result(reply),
            Err(e) => {
                tracing::warn!("call {} ({}) failed: {}", call_id, method, e);
                ResponseBody::Error(RemoteError::from(&e))
            }
        };
        if outbound
            .send(WorkerMessage::Response(Response { call_id, body }))
            .is_err()
        {
            tracing::debug!("caller went away, closing {} lane", method);
            break;
        }
    }
}

async fn dispatch(
    facade: &EngineFacade,
    call: Call,
    outbound: &Outbound,
) -> Result<Reply, FacadeError> {
    match call {
        Call::Init => {
            let updates = outbound.clone();
            let observer: WriteObserver = Arc::new(move |value| {
                let _ = updates.send(WorkerMessage::Notification(
                    Notification::WritesCountUpdate { value },
                ));
            });
            facade.init(Some(observer)).await?;
            Ok(Reply::Done)
        }
        Call::RunCommand {
            script,
            params,
            read_only,
        } => {
            let outcome = match params {
                Some(params) => facade.run_command_with_params(&script, &params, read_only)?,
                None => facade.run_command(&script, read_only)?,
            };
            Ok(Reply::Query(outcome))
        }
        Call::Put { table, rows } => Ok(Reply::Query(facade.put(&table, &rows)?)),
        Call::Get { table, conditions } => Ok(Reply::Query(facade.get(&table, &conditions)?)),
        Call::Remove { table, keys } => Ok(Reply::Query(facade.remove(&table, &keys)?)),
        Call::ExecuteBatchPutCommand {
            table,
            rows,
            batch_size,
            progress,
        } => {
            let report = facade
                .execute_batch_put_command(&table, &rows, batch_size, |written| {
                    if let Some(callback_id) = progress {
                        let _ = outbound.send(WorkerMessage::Notification(Notification::Progress {
                            callback_id,
                            written,
                        }));
                    }
                })
                .await?;
            Ok(Reply::Batch(report))
        }
        Call::FlushPendingWrites { timeout_ms } => {
            facade
                .flush_pending_writes(Duration::from_millis(timeout_ms))
                .await?;
            Ok(Reply::Done)
        }
        Call::ExportRelations { relations } => Ok(Reply::Export(
            facade.export_relations(relations.as_slice())?,
        )),
        Call::ImportRelations { data } => Ok(Reply::Import(facade.import_relations(&data)?)),
    }
}
