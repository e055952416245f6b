// ABOUTME: Configuration loading and validation for the strata bridge.
// ABOUTME: Reads STRATA_* environment variables with defaults for every setting.

use std::path::PathBuf;
use std::time::Duration;

use strata_store::WriteOrdering;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("STRATA_FLUSH_TIMEOUT_MS is not a number of milliseconds: {0}")]
    InvalidFlushTimeout(String),

    #[error("STRATA_BATCH_SIZE must be a positive integer: {0}")]
    InvalidBatchSize(String),

    #[error("STRATA_WRITE_ORDERING must be `per-key` or `unordered`: {0}")]
    InvalidWriteOrdering(String),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Bridge configuration: where the durable store lives and how writes and
/// batches behave.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub home: PathBuf,
    pub store_name: String,
    pub store_id: String,
    pub flush_timeout: Duration,
    pub batch_size: usize,
    pub write_ordering: WriteOrdering,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            home: default_home(None),
            store_name: "strata".to_string(),
            store_id: "kv".to_string(),
            flush_timeout: Duration::from_millis(5000),
            batch_size: 1000,
            write_ordering: WriteOrdering::PerKey,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - STRATA_HOME: data directory (default: ~/.strata)
    /// - STRATA_STORE_NAME: database name inside the home (default: strata)
    /// - STRATA_STORE_ID: object store id inside the database (default: kv)
    /// - STRATA_FLUSH_TIMEOUT_MS: write barrier bound (default: 5000)
    /// - STRATA_BATCH_SIZE: rows per batch-put chunk (default: 1000)
    /// - STRATA_WRITE_ORDERING: `per-key` or `unordered` (default: per-key)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`BridgeConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let var = |name: &str| lookup(name).filter(|v| !v.is_empty());

        let home = var("STRATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_home(lookup("HOME")));

        let store_name = var("STRATA_STORE_NAME").unwrap_or(defaults.store_name);
        let store_id = var("STRATA_STORE_ID").unwrap_or(defaults.store_id);
        if store_name.trim().is_empty() {
            return Err(ConfigError::Empty("STRATA_STORE_NAME"));
        }
        if store_id.trim().is_empty() {
            return Err(ConfigError::Empty("STRATA_STORE_ID"));
        }

        let flush_timeout = match var("STRATA_FLUSH_TIMEOUT_MS") {
            Some(raw) => raw
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| ConfigError::InvalidFlushTimeout(raw))?,
            None => defaults.flush_timeout,
        };

        let batch_size = match var("STRATA_BATCH_SIZE") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(ConfigError::InvalidBatchSize(raw)),
            },
            None => defaults.batch_size,
        };

        let write_ordering = match var("STRATA_WRITE_ORDERING") {
            Some(raw) => raw.parse().map_err(ConfigError::InvalidWriteOrdering)?,
            None => defaults.write_ordering,
        };

        Ok(Self {
            home,
            store_name,
            store_id,
            flush_timeout,
            batch_size,
            write_ordering,
        })
    }
}

fn default_home(home_var: Option<String>) -> PathBuf {
    home_var
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join(".strata")
}
