// ABOUTME: Schema-driven command factory that turns rows and conditions into engine script text.
// ABOUTME: Every command is validated against the SchemaCatalog and every literal is escaped.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::{ColumnDescriptor, SchemaCatalog, TableSchema};
use crate::value::Value;

/// Errors raised when a command cannot be built for the given input.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("unknown column {column} in table {table}")]
    UnknownColumn { table: String, column: String },

    #[error("row {row} of {table} has {got} values, expected {expected}")]
    ArityMismatch {
        table: String,
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("row {row} of {table}: column {column} expects {expected}, got {got}")]
    TypeMismatch {
        table: String,
        row: usize,
        column: String,
        expected: String,
        got: &'static str,
    },

    #[error("row {row} of {table}: column {column} holds a non-finite float")]
    NonFiniteFloat {
        table: String,
        row: usize,
        column: String,
    },
}

/// The kind of script a command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Put,
    Get,
    Remove,
}

/// A generated, validated engine script. Only the factory constructs these.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    kind: CommandKind,
    table: String,
    script: String,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn into_script(self) -> String {
        self.script
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.script)
    }
}

/// Comparison operators available to typed conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
}

impl CompareOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

/// A filter clause for `get`. `Raw` text is appended verbatim and is the
/// caller's responsibility; `Compare` is checked against the schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Condition {
    Compare {
        column: String,
        op: CompareOp,
        value: Value,
    },
    Raw {
        text: String,
    },
}

impl Condition {
    pub fn compare(column: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Condition::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, CompareOp::Eq, value)
    }

    pub fn raw(text: impl Into<String>) -> Self {
        Condition::Raw { text: text.into() }
    }
}

/// Builds commands for the tables of one catalog. Pure: identical catalog and
/// input always produce identical script text.
pub struct CommandFactory<'a> {
    catalog: &'a SchemaCatalog,
}

impl<'a> CommandFactory<'a> {
    pub fn new(catalog: &'a SchemaCatalog) -> Self {
        Self { catalog }
    }

    fn schema(&self, table: &str) -> Result<&'a TableSchema, CommandError> {
        self.catalog
            .get(table)
            .ok_or_else(|| CommandError::UnknownTable(table.to_string()))
    }

    /// Inline literal relation over the table's full column order:
    /// `?[id, name] <- [[1, "a"], [2, "b"]]`.
    pub fn atom(&self, table: &str, rows: &[Vec<Value>]) -> Result<String, CommandError> {
        let schema = self.schema(table)?;
        let columns: Vec<_> = schema.column_order().collect();
        literal_relation(table, &columns, rows)
    }

    /// Upsert of the staged literal relation into `table`:
    /// `:put t {k => v}`, or `:put t {k}` when the table has no value columns.
    pub fn put_clause(&self, table: &str) -> Result<String, CommandError> {
        let schema = self.schema(table)?;
        Ok(format!(":put {} {{{}}}", table, binding_spec(schema)))
    }

    /// Check `rows` against the table's column order without rendering them.
    /// Row indices in errors count from the start of `rows`.
    pub fn validate_rows(&self, table: &str, rows: &[Vec<Value>]) -> Result<(), CommandError> {
        let schema = self.schema(table)?;
        let columns: Vec<_> = schema.column_order().collect();
        rows.iter()
            .enumerate()
            .try_for_each(|(row_idx, row)| check_row(table, &columns, row_idx, row))
    }

    /// Atom plus put clause, committed by the engine in one round trip.
    pub fn put(&self, table: &str, rows: &[Vec<Value>]) -> Result<Command, CommandError> {
        let atom = self.atom(table, rows)?;
        let put = self.put_clause(table)?;
        Ok(Command {
            kind: CommandKind::Put,
            table: table.to_string(),
            script: format!("{}\n{}", atom, put),
        })
    }

    /// Projection of every declared column of `table`, filtered by the
    /// given conditions: `?[id, name] := *t{id, name}, id > 3`.
    pub fn get(&self, table: &str, conditions: &[Condition]) -> Result<Command, CommandError> {
        let schema = self.schema(table)?;
        let columns = column_list(schema.column_order());
        let mut script = format!("?[{}] := *{}{{{}}}", columns, table, columns);

        for condition in conditions {
            script.push_str(", ");
            match condition {
                Condition::Raw { text } => script.push_str(text),
                Condition::Compare { column, op, value } => {
                    let desc = schema.column(column).ok_or_else(|| CommandError::UnknownColumn {
                        table: table.to_string(),
                        column: column.clone(),
                    })?;
                    check_value(table, 0, desc, value)?;
                    script.push_str(&format!("{} {} {}", column, op.symbol(), value.to_literal()));
                }
            }
        }

        Ok(Command {
            kind: CommandKind::Get,
            table: table.to_string(),
            script,
        })
    }

    /// Deletion of rows by key: each entry of `keys` holds the key columns only.
    pub fn remove(&self, table: &str, keys: &[Vec<Value>]) -> Result<Command, CommandError> {
        let schema = self.schema(table)?;
        let key_columns: Vec<_> = schema.key_columns().collect();
        let atom = literal_relation(table, &key_columns, keys)?;
        Ok(Command {
            kind: CommandKind::Remove,
            table: table.to_string(),
            script: format!(
                "{}\n:rm {} {{{}}}",
                atom,
                table,
                column_list(key_columns.iter().copied())
            ),
        })
    }
}

fn column_list<'c>(columns: impl Iterator<Item = &'c ColumnDescriptor>) -> String {
    columns
        .map(|c| c.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn binding_spec(schema: &TableSchema) -> String {
    let keys = schema.keys().join(", ");
    if schema.values().is_empty() {
        keys
    } else {
        format!("{} => {}", keys, schema.values().join(", "))
    }
}

fn literal_relation(
    table: &str,
    columns: &[&ColumnDescriptor],
    rows: &[Vec<Value>],
) -> Result<String, CommandError> {
    let mut rendered_rows = Vec::with_capacity(rows.len());
    for (row_idx, row) in rows.iter().enumerate() {
        check_row(table, columns, row_idx, row)?;
        let cells: Vec<String> = row.iter().map(Value::to_literal).collect();
        rendered_rows.push(format!("[{}]", cells.join(", ")));
    }

    Ok(format!(
        "?[{}] <- [{}]",
        column_list(columns.iter().copied()),
        rendered_rows.join(", ")
    ))
}

fn check_row(
    table: &str,
    columns: &[&ColumnDescriptor],
    row_idx: usize,
    row: &[Value],
) -> Result<(), CommandError> {
    if row.len() != columns.len() {
        return Err(CommandError::ArityMismatch {
            table: table.to_string(),
            row: row_idx,
            expected: columns.len(),
            got: row.len(),
        });
    }
    columns
        .iter()
        .zip(row)
        .try_for_each(|(desc, value)| check_value(table, row_idx, desc, value))
}

fn check_value(
    table: &str,
    row: usize,
    desc: &ColumnDescriptor,
    value: &Value,
) -> Result<(), CommandError> {
    if !desc.accepts(value) {
        return Err(CommandError::TypeMismatch {
            table: table.to_string(),
            row,
            column: desc.name.clone(),
            expected: if desc.nullable {
                format!("{}?", desc.column_type)
            } else {
                desc.column_type.to_string()
            },
            got: value.type_name(),
        });
    }
    if let Value::Float(f) = value
        && !f.is_finite()
    {
        return Err(CommandError::NonFiniteFloat {
            table: table.to_string(),
            row,
            column: desc.name.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnType;

    fn col(name: &str, ty: ColumnType, ordinal: usize, is_key: bool) -> ColumnDescriptor {
        ColumnDescriptor {
            name: name.to_string(),
            column_type: ty,
            ordinal,
            is_key,
            has_default: false,
            nullable: false,
        }
    }

    fn catalog() -> SchemaCatalog {
        let mut catalog = SchemaCatalog::new();
        catalog.insert(
            "t1",
            TableSchema::from_columns(vec![
                col("id", ColumnType::Int, 0, true),
                col("name", ColumnType::String, 1, false),
            ])
            .unwrap(),
        );
        catalog.insert(
            "tags",
            TableSchema::from_columns(vec![col("tag", ColumnType::String, 0, true)]).unwrap(),
        );
        catalog
    }

    fn rows() -> Vec<Vec<Value>> {
        vec![
            vec![Value::from(1), Value::from("a")],
            vec![Value::from(2), Value::from("b")],
        ]
    }

    #[test]
    fn atom_quotes_strings_and_leaves_other_literals_raw() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let atom = factory.atom("t1", &rows()).unwrap();
        assert_eq!(atom, r#"?[id, name] <- [[1, "a"], [2, "b"]]"#);
    }

    #[test]
    fn put_clause_maps_keys_to_values() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        assert_eq!(factory.put_clause("t1").unwrap(), ":put t1 {id => name}");
    }

    #[test]
    fn put_clause_projects_keys_only_for_keyless_value_tables() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        assert_eq!(factory.put_clause("tags").unwrap(), ":put tags {tag}");
    }

    #[test]
    fn put_joins_atom_and_clause_into_one_script() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let cmd = factory.put("t1", &rows()).unwrap();
        assert_eq!(cmd.kind(), CommandKind::Put);
        assert_eq!(
            cmd.script(),
            "?[id, name] <- [[1, \"a\"], [2, \"b\"]]\n:put t1 {id => name}"
        );
    }

    #[test]
    fn put_is_deterministic() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        assert_eq!(
            factory.put("t1", &rows()).unwrap(),
            factory.put("t1", &rows()).unwrap()
        );
    }

    #[test]
    fn get_projects_all_columns_and_appends_conditions() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let cmd = factory
            .get(
                "t1",
                &[
                    Condition::compare("id", CompareOp::Gt, 1),
                    Condition::raw("name != \"z\""),
                ],
            )
            .unwrap();
        assert_eq!(
            cmd.script(),
            "?[id, name] := *t1{id, name}, id > 1, name != \"z\""
        );
    }

    #[test]
    fn get_rejects_unknown_condition_column() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let err = factory.get("t1", &[Condition::eq("nope", 1)]).unwrap_err();
        assert!(matches!(err, CommandError::UnknownColumn { column, .. } if column == "nope"));
    }

    #[test]
    fn remove_uses_key_columns_only() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let cmd = factory.remove("t1", &[vec![Value::from(2)]]).unwrap();
        assert_eq!(cmd.script(), "?[id] <- [[2]]\n:rm t1 {id}");
    }

    #[test]
    fn injection_attempt_stays_inside_its_literal() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        let hostile = vec![vec![Value::from(1), Value::from("x\"]]\n:rm t1 {id}")]];
        let cmd = factory.put("t1", &hostile).unwrap();
        // The only unescaped newline is the one separating atom and clause.
        assert_eq!(cmd.script().matches('\n').count(), 1);
        assert!(cmd.script().ends_with(":put t1 {id => name}"));
    }

    #[test]
    fn validation_rejects_bad_rows() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);

        assert_eq!(
            factory.put("missing", &rows()).unwrap_err(),
            CommandError::UnknownTable("missing".to_string())
        );
        assert!(matches!(
            factory.put("t1", &[vec![Value::from(1)]]).unwrap_err(),
            CommandError::ArityMismatch { expected: 2, got: 1, .. }
        ));
        assert!(matches!(
            factory
                .put("t1", &[vec![Value::from("1"), Value::from("a")]])
                .unwrap_err(),
            CommandError::TypeMismatch { got: "String", .. }
        ));
    }

    #[test]
    fn validate_rows_reports_absolute_row_index() {
        let catalog = catalog();
        let factory = CommandFactory::new(&catalog);
        assert_eq!(factory.validate_rows("t1", &rows()), Ok(()));

        let mut bad = rows();
        bad.push(vec![Value::from(3), Value::from(4)]);
        assert!(matches!(
            factory.validate_rows("t1", &bad).unwrap_err(),
            CommandError::TypeMismatch { row: 2, .. }
        ));
        assert_eq!(
            factory.validate_rows("missing", &bad).unwrap_err(),
            CommandError::UnknownTable("missing".to_string())
        );
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        let mut catalog = SchemaCatalog::new();
        catalog.insert(
            "m",
            TableSchema::from_columns(vec![
                col("k", ColumnType::Int, 0, true),
                col("v", ColumnType::Float, 1, false),
            ])
            .unwrap(),
        );
        let factory = CommandFactory::new(&catalog);
        let err = factory
            .put("m", &[vec![Value::from(1), Value::Float(f64::NAN)]])
            .unwrap_err();
        assert!(matches!(err, CommandError::NonFiniteFloat { .. }));
    }
}
