// ABOUTME: Core library for strata: schema model, command factory, and engine call surface.
// ABOUTME: Everything here is pure data and pure functions shared by the store, engine, and proxy crates.

pub mod command;
pub mod engine;
pub mod outcome;
pub mod schema;
pub mod value;

pub use command::{Command, CommandError, CommandFactory, CommandKind, CompareOp, Condition};
pub use engine::{Engine, EngineFactory, HydrateError, WriteSink};
pub use outcome::{
    EngineError, EngineFailure, ExportOutcome, ImportOutcome, NamedRows, Outcome, QueryOutcome,
};
pub use schema::{ColumnDescriptor, ColumnType, SchemaCatalog, ShapeError, TableSchema};
pub use value::Value;
