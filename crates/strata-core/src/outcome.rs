// ABOUTME: Parsing of engine JSON responses into typed outcomes.
// ABOUTME: An `ok:false` response is data (Outcome::Failed), only unparseable responses are errors.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an engine response cannot be interpreted at all.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed engine response: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("engine response has no boolean `ok` field")]
    MissingOk,
}

/// A query-level failure reported by the engine. Recoverable; callers branch
/// on it instead of catching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

/// Either the payload of a successful engine call or the engine's failure report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "camelCase")]
pub enum Outcome<T> {
    Ok(T),
    Failed(EngineFailure),
}

impl<T> Outcome<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            Outcome::Ok(v) => Some(v),
            Outcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&EngineFailure> {
        match self {
            Outcome::Ok(_) => None,
            Outcome::Failed(f) => Some(f),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Failed(e) => Outcome::Failed(e),
        }
    }
}

/// Tabular result of a query: column headers and row values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedRows {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub took: Option<f64>,
}

impl NamedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a header, if present.
    pub fn column_index(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }
}

pub type QueryOutcome = Outcome<NamedRows>;
pub type ExportOutcome = Outcome<BTreeMap<String, NamedRows>>;
pub type ImportOutcome = Outcome<()>;

/// Parse the response of `run`.
pub fn parse_query_response(raw: &str) -> Result<QueryOutcome, EngineError> {
    match split_ok(raw)? {
        Ok(body) => Ok(Outcome::Ok(from_body(body)?)),
        Err(failure) => Ok(Outcome::Failed(failure)),
    }
}

/// Parse the response of `export`, whose payload sits under `data`.
pub fn parse_export_response(raw: &str) -> Result<ExportOutcome, EngineError> {
    match split_ok(raw)? {
        Ok(mut body) => {
            let data = body
                .get_mut("data")
                .map(serde_json::Value::take)
                .unwrap_or_else(|| serde_json::Value::Object(Default::default()));
            Ok(Outcome::Ok(from_body(data)?))
        }
        Err(failure) => Ok(Outcome::Failed(failure)),
    }
}

/// Parse the response of `import`, which carries no payload.
pub fn parse_import_response(raw: &str) -> Result<ImportOutcome, EngineError> {
    Ok(split_ok(raw)?.map_or_else(Outcome::Failed, |_| Outcome::Ok(())))
}

fn from_body<T: DeserializeOwned>(body: serde_json::Value) -> Result<T, EngineError> {
    Ok(serde_json::from_value(body)?)
}

fn split_ok(raw: &str) -> Result<Result<serde_json::Value, EngineFailure>, EngineError> {
    let body: serde_json::Value = serde_json::from_str(raw)?;
    match body.get("ok").and_then(serde_json::Value::as_bool) {
        Some(true) => Ok(Ok(body)),
        Some(false) => Ok(Err(serde_json::from_value(body)?)),
        None => Err(EngineError::MissingOk),
    }
}
