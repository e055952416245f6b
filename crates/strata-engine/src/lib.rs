// ABOUTME: Engine facade for strata: hydrates the engine from the store and exposes schema-driven I/O.
// ABOUTME: Also holds configuration loading and an in-memory reference engine for tests.

pub mod bootstrap;
pub mod config;
pub mod facade;
pub mod testing;

pub use bootstrap::{SchemaError, load_catalog};
pub use config::{BridgeConfig, ConfigError};
pub use facade::{BatchReport, EngineFacade, FacadeError};
