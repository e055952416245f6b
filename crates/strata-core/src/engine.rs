// ABOUTME: The call surface of the embedded query engine, which is an external collaborator.
// ABOUTME: Engines are hydrated from raw store entries and report their own writes through a sink.

use std::sync::Arc;

use thiserror::Error;

/// Receives every raw key/value mutation the engine makes to its storage.
/// `None` is a tombstone (delete). Invoked synchronously from inside engine calls.
pub type WriteSink = Arc<dyn Fn(Vec<u8>, Option<Vec<u8>>) + Send + Sync>;

/// Raised when an engine cannot be rebuilt from persisted entries.
#[derive(Debug, Error)]
#[error("engine hydration failed: {0}")]
pub struct HydrateError(pub String);

/// The narrow surface through which the bridge drives the engine. All three
/// calls exchange JSON text; query-level failures come back as `ok:false`.
pub trait Engine: Send + Sync {
    /// Run a script with a JSON object of parameters.
    fn run(&self, script: &str, params: &str, read_only: bool) -> String;

    /// Export the named relations (comma separated) as JSON.
    fn export(&self, relations_csv: &str) -> String;

    /// Import relation data as produced by `export`. Engine triggers are not
    /// run for imported rows.
    fn import(&self, data: &str) -> String;
}

/// Builds an engine instance whose storage starts from the given entries.
/// `keys` and `values` are index-paired.
pub trait EngineFactory: Send + Sync {
    fn hydrate(
        &self,
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
        sink: WriteSink,
    ) -> Result<Arc<dyn Engine>, HydrateError>;
}
