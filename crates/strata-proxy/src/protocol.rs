// ABOUTME: Message protocol between the caller and the isolated engine worker.
// ABOUTME: Requests carry a call id, responses echo it, and notifications travel out of band.

use serde::{Deserialize, Serialize};
use strata_core::{Condition, ExportOutcome, ImportOutcome, QueryOutcome, Value};
use strata_engine::{BatchReport, FacadeError};
use thiserror::Error;

/// One call into the worker: `{"callId": 7, "method": "put", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub call_id: u64,
    #[serde(flatten)]
    pub call: Call,
}

/// The facade operation a request invokes, with its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum Call {
    Init,
    #[serde(rename_all = "camelCase")]
    RunCommand {
        script: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Map<String, serde_json::Value>>,
        read_only: bool,
    },
    Put {
        table: String,
        rows: Vec<Vec<Value>>,
    },
    Get {
        table: String,
        conditions: Vec<Condition>,
    },
    Remove {
        table: String,
        keys: Vec<Vec<Value>>,
    },
    /// `progress` is the callback id progress notifications are tagged with.
    #[serde(rename_all = "camelCase")]
    ExecuteBatchPutCommand {
        table: String,
        rows: Vec<Vec<Value>>,
        batch_size: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    FlushPendingWrites {
        timeout_ms: u64,
    },
    ExportRelations {
        relations: Vec<String>,
    },
    ImportRelations {
        data: serde_json::Value,
    },
}

impl Call {
    /// Wire name of the method. Requests with the same name share a lane.
    pub fn method(&self) -> &'static str {
        match self {
            Call::Init => "init",
            Call::RunCommand { .. } => "runCommand",
            Call::Put { .. } => "put",
            Call::Get { .. } => "get",
            Call::Remove { .. } => "remove",
            Call::ExecuteBatchPutCommand { .. } => "executeBatchPutCommand",
            Call::FlushPendingWrites { .. } => "flushPendingWrites",
            Call::ExportRelations { .. } => "exportRelations",
            Call::ImportRelations { .. } => "importRelations",
        }
    }
}

/// Answer to one request: `{"callId": 7, "result": ...}` or `{"callId": 7, "error": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub call_id: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseBody {
    Result(Reply),
    Error(RemoteError),
}

/// Successful result payloads, one shape per kind of operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Reply {
    Done,
    Query(QueryOutcome),
    Batch(BatchReport),
    Export(ExportOutcome),
    Import(ImportOutcome),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Done => "done",
            Reply::Query(_) => "query",
            Reply::Batch(_) => "batch",
            Reply::Export(_) => "export",
            Reply::Import(_) => "import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    Transport,
    Store,
    Schema,
    Timeout,
    Command,
    Engine,
    NotInitialized,
    InvalidArgument,
}

/// An error raised inside the worker, flattened to a kind and a message.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind:?} error: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&FacadeError> for RemoteError {
    fn from(err: &FacadeError) -> Self {
        let kind = match err {
            FacadeError::NotInitialized => ErrorKind::NotInitialized,
            FacadeError::Store(_) => ErrorKind::Store,
            FacadeError::Hydrate(_) | FacadeError::Engine(_) => ErrorKind::Engine,
            FacadeError::Schema(_) => ErrorKind::Schema,
            FacadeError::Command(_) => ErrorKind::Command,
            FacadeError::Timeout(_) => ErrorKind::Timeout,
            FacadeError::InvalidBatchSize => ErrorKind::InvalidArgument,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Pushed by the worker outside any request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    WritesCountUpdate {
        value: usize,
    },
    #[serde(rename_all = "camelCase")]
    Progress {
        callback_id: u64,
        written: usize,
    },
}

/// Everything the worker sends back to the caller, in one ordered stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WorkerMessage {
    Notification(Notification),
    Response(Response),
}
