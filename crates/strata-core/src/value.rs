// ABOUTME: Typed scalar literal used for rows, keys, and condition operands.
// ABOUTME: Serializes as a plain JSON scalar and renders as an escaped script literal.

use serde::{Deserialize, Serialize};

/// A single cell value. The untagged representation means a `Value` travels
/// over the wire as the bare JSON scalar (`null`, `true`, `3`, `1.5`, `"a"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// Human-readable name of the variant, used in validation errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::String(_) => "String",
        }
    }

    /// Render the value as a script literal. Strings are emitted with JSON
    /// escaping inside double quotes, so the content can never terminate the
    /// literal early. Callers must reject non-finite floats beforehand.
    pub(crate) fn to_literal(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            // Debug formatting keeps the decimal point (`1.0`) and switches to
            // exponent notation for large magnitudes.
            Value::Float(f) => format!("{:?}", f),
            Value::String(s) => serde_json::Value::String(s.clone()).to_string(),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Value::from(f),
            Value::String(s) => serde_json::Value::String(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}
