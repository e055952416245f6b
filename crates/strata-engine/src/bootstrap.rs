// ABOUTME: Schema catalog bootstrap: introspects the engine's relations and columns.
// ABOUTME: Applies the caller's initialization script first when the engine has no relations.

use serde_json::Value as JsonValue;
use strata_core::outcome::parse_query_response;
use strata_core::{ColumnDescriptor, Engine, NamedRows, Outcome, SchemaCatalog, TableSchema};
use thiserror::Error;

/// Errors that make bootstrap, and therefore `init`, fail.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("listing relations failed: {message}")]
    Listing { message: String },

    #[error("initialization script failed: {message}")]
    InitScript { message: String },

    #[error("introspection of relation {relation} failed: {message}")]
    Relation { relation: String, message: String },
}

/// Build the schema catalog from the engine's current relations, running
/// `init_script` first if there are none. Deterministic for an unchanged
/// engine: calling it twice yields equal catalogs.
pub fn load_catalog(engine: &dyn Engine, init_script: &str) -> Result<SchemaCatalog, SchemaError> {
    let mut names = list_relations(engine)?;

    if names.is_empty() && !init_script.trim().is_empty() {
        tracing::info!("engine has no relations, applying initialization script");
        introspect(engine, init_script, false)
            .map_err(|message| SchemaError::InitScript { message })?;
        names = list_relations(engine)?;
    }

    let mut catalog = SchemaCatalog::new();
    for name in names {
        let schema = describe_relation(engine, &name)?;
        tracing::debug!(
            "relation {}: keys {:?}, values {:?}",
            name,
            schema.keys(),
            schema.values()
        );
        catalog.insert(name, schema);
    }

    tracing::info!("schema catalog ready with {} relations", catalog.len());
    Ok(catalog)
}

/// Run a script and demand a successful tabular result.
fn introspect(engine: &dyn Engine, script: &str, read_only: bool) -> Result<NamedRows, String> {
    let raw = engine.run(script, "{}", read_only);
    match parse_query_response(&raw) {
        Ok(Outcome::Ok(rows)) => Ok(rows),
        Ok(Outcome::Failed(failure)) => Err(failure.message),
        Err(e) => Err(e.to_string()),
    }
}

fn list_relations(engine: &dyn Engine) -> Result<Vec<String>, SchemaError> {
    let rows = introspect(engine, "::relations", true)
        .map_err(|message| SchemaError::Listing { message })?;

    let name_idx = rows.column_index("name").unwrap_or(0);
    rows.rows
        .iter()
        .map(|row| {
            row.get(name_idx)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| SchemaError::Listing {
                    message: format!("relation row without a name: {:?}", row),
                })
        })
        .collect()
}

fn describe_relation(engine: &dyn Engine, relation: &str) -> Result<TableSchema, SchemaError> {
    let fail = |message: String| SchemaError::Relation {
        relation: relation.to_string(),
        message,
    };

    let rows = introspect(engine, &format!("::columns {}", relation), true).map_err(fail)?;

    let header = |name: &str| {
        rows.column_index(name)
            .ok_or_else(|| fail(format!("column listing has no `{}` header", name)))
    };
    let name_idx = header("column")?;
    let key_idx = header("is_key")?;
    let ordinal_idx = header("index")?;
    let type_idx = header("type")?;
    let default_idx = header("has_default")?;

    let null = JsonValue::Null;
    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows.rows {
        let cell = |idx: usize| row.get(idx).unwrap_or(&null);
        let malformed = || fail(format!("malformed column row: {:?}", row));

        let name = cell(name_idx).as_str().ok_or_else(malformed)?;
        let type_str = cell(type_idx).as_str().ok_or_else(malformed)?;
        let (column_type, nullable) =
            ColumnDescriptor::parse_type(type_str).map_err(|e| fail(e.to_string()))?;

        columns.push(ColumnDescriptor {
            name: name.to_string(),
            column_type,
            ordinal: cell(ordinal_idx).as_u64().ok_or_else(malformed)? as usize,
            is_key: cell(key_idx).as_bool().ok_or_else(malformed)?,
            has_default: cell(default_idx).as_bool().ok_or_else(malformed)?,
            nullable,
        });
    }

    TableSchema::from_columns(columns).map_err(|e| fail(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ReferenceEngine;
    use strata_core::ColumnType;

    const INIT: &str = "{:create t1 {id: Int => name: String}}\n{:create tags {tag: String}}";

    #[test]
    fn applies_init_script_when_engine_is_empty() {
        let engine = ReferenceEngine::empty();
        let catalog = load_catalog(&engine, INIT).unwrap();

        assert_eq!(catalog.table_names().collect::<Vec<_>>(), ["t1", "tags"]);
        let t1 = catalog.get("t1").unwrap();
        assert_eq!(t1.keys(), ["id"]);
        assert_eq!(t1.values(), ["name"]);
        assert_eq!(t1.column("name").unwrap().column_type, ColumnType::String);
        assert_eq!(t1.column("name").unwrap().ordinal, 1);
        assert!(catalog.get("tags").unwrap().values().is_empty());
    }

    #[test]
    fn skips_init_script_when_relations_exist() {
        let engine = ReferenceEngine::empty();
        load_catalog(&engine, INIT).unwrap();

        // A second, different script must not be applied.
        let catalog = load_catalog(&engine, "{:create other {x: Int}}").unwrap();
        assert!(catalog.get("other").is_none());
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn bootstrapping_twice_yields_identical_catalog() {
        let engine = ReferenceEngine::empty();
        let first = load_catalog(&engine, INIT).unwrap();
        let second = load_catalog(&engine, INIT).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn nullable_and_default_flags_are_read() {
        let engine = ReferenceEngine::empty();
        let catalog = load_catalog(
            &engine,
            ":create notes {id: Int => body: String?, score: Float default 0.0}",
        )
        .unwrap();
        let notes = catalog.get("notes").unwrap();
        let body = notes.column("body").unwrap();
        assert!(body.nullable);
        assert!(!body.has_default);
        assert!(notes.column("score").unwrap().has_default);
    }

    #[test]
    fn failing_init_script_is_a_schema_error() {
        let engine = ReferenceEngine::empty();
        let err = load_catalog(&engine, "this is not a script").unwrap_err();
        assert!(matches!(err, SchemaError::InitScript { .. }));
    }

    #[test]
    fn unsupported_column_type_names_the_relation() {
        let engine = ReferenceEngine::empty();
        let err = load_catalog(&engine, ":create blobs {id: Int => data: Bytes}").unwrap_err();
        match err {
            SchemaError::Relation { relation, message } => {
                assert_eq!(relation, "blobs");
                assert!(message.contains("Bytes"), "message: {}", message);
            }
            other => panic!("expected Relation error, got {:?}", other),
        }
    }
}
