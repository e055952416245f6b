// ABOUTME: Offload proxy for strata: the engine facade runs on an isolated worker thread.
// ABOUTME: Callers talk to it through ProxyHandle, which speaks the request/response protocol.

pub mod handle;
pub mod protocol;
mod worker;

pub use handle::{ProxyError, ProxyHandle};
pub use protocol::{
    Call, ErrorKind, Notification, RemoteError, Reply, Request, Response, ResponseBody,
    WorkerMessage,
};
