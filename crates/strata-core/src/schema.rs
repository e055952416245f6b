// ABOUTME: Schema data model: column descriptors, per-table schemas, and the schema catalog.
// ABOUTME: TableSchema enforces the key/value partition of columns at construction time.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::value::Value;

/// Errors raised while assembling a table schema from column descriptors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShapeError {
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),

    #[error("duplicate column: {0}")]
    DuplicateColumn(String),

    #[error("relation has no columns")]
    NoColumns,
}

/// The column types the command layer knows how to emit literals for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    String,
    Int,
    Bool,
    Float,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "String",
            ColumnType::Int => "Int",
            ColumnType::Bool => "Bool",
            ColumnType::Float => "Float",
        };
        f.write_str(name)
    }
}

impl FromStr for ColumnType {
    type Err = ShapeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "String" => Ok(ColumnType::String),
            "Int" => Ok(ColumnType::Int),
            "Bool" => Ok(ColumnType::Bool),
            "Float" => Ok(ColumnType::Float),
            other => Err(ShapeError::UnsupportedType(other.to_string())),
        }
    }
}

/// One column of a stored relation, as reported by engine introspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    pub name: String,
    pub column_type: ColumnType,
    pub ordinal: usize,
    pub is_key: bool,
    pub has_default: bool,
    pub nullable: bool,
}

impl ColumnDescriptor {
    /// Parse an engine type string such as `Int` or `String?` (nullable).
    pub fn parse_type(type_str: &str) -> Result<(ColumnType, bool), ShapeError> {
        let trimmed = type_str.trim();
        match trimmed.strip_suffix('?') {
            Some(inner) => Ok((inner.parse()?, true)),
            None => Ok((trimmed.parse()?, false)),
        }
    }

    /// Whether a value may be stored in this column. Integers are accepted by
    /// float columns; null only by nullable columns.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self.column_type, value) {
            (_, Value::Null) => self.nullable,
            (ColumnType::String, Value::String(_)) => true,
            (ColumnType::Int, Value::Int(_)) => true,
            (ColumnType::Bool, Value::Bool(_)) => true,
            (ColumnType::Float, Value::Float(_) | Value::Int(_)) => true,
            _ => false,
        }
    }
}

/// Schema of a single relation: its key columns, its value columns, and the
/// descriptor of every column. Every column is in exactly one of the lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    keys: Vec<String>,
    values: Vec<String>,
    columns: BTreeMap<String, ColumnDescriptor>,
}

impl TableSchema {
    /// Build a schema from descriptors in any order. Columns are ordered by
    /// ordinal and partitioned on their key flag.
    pub fn from_columns(mut columns: Vec<ColumnDescriptor>) -> Result<Self, ShapeError> {
        if columns.is_empty() {
            return Err(ShapeError::NoColumns);
        }
        columns.sort_by_key(|c| c.ordinal);

        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut by_name = BTreeMap::new();
        for col in columns {
            if by_name.contains_key(&col.name) {
                return Err(ShapeError::DuplicateColumn(col.name));
            }
            if col.is_key {
                keys.push(col.name.clone());
            } else {
                values.push(col.name.clone());
            }
            by_name.insert(col.name.clone(), col);
        }

        Ok(Self {
            keys,
            values,
            columns: by_name,
        })
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.get(name)
    }

    /// All columns in declaration order: keys first, then values.
    pub fn column_order(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.keys
            .iter()
            .chain(self.values.iter())
            .filter_map(|name| self.columns.get(name))
    }

    /// Key columns in declaration order.
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.keys.iter().filter_map(|name| self.columns.get(name))
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }
}

/// Map of relation name to schema, built once at bootstrap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: impl Into<String>, schema: TableSchema) {
        self.tables.insert(table.into(), schema);
    }

    pub fn get(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
