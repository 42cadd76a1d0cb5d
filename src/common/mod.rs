// Shared value model for the engine.
//
// Rows are dynamically typed maps from column name to `Value`. The variant
// set is closed: it mirrors the tags the page codec understands, so any row
// held in memory can be spilled and reloaded without loss.

pub mod context;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

pub use context::OperationContext;

/// A row is a mapping from column name to value.
pub type Row = HashMap<String, Value>;

/// 1-based positional identifier of a row within a table version.
pub type RowId = u64;

/// Dynamically typed value stored in a row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean true/false
    Bool(bool),

    /// 32-bit signed integer
    Int32(i32),

    /// 64-bit signed integer
    Int64(i64),

    /// 32-bit floating point
    Float32(f32),

    /// 64-bit floating point
    Float64(f64),

    /// Variable-length string (UTF-8)
    String(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Instant in time (UTC)
    Timestamp(DateTime<Utc>),

    /// Homogeneous vector of 32-bit floats
    Vector(Vec<f32>),

    /// Ordered sequence of values
    Array(Vec<Value>),

    /// Mapping of string to value
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get type name as string
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::Float32(_) => "float32",
            Value::Float64(_) => "float64",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Vector(_) => "vector",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    /// Integer view with widening; None for non-integer values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric view; integers widen to f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(v) => Some(*v as f64),
            Value::Int64(v) => Some(*v as f64),
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f32]> {
        match self {
            Value::Vector(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// True when the value is a numeric zero. Auto-increment treats zero the
    /// same as an absent value.
    pub fn is_numeric_zero(&self) -> bool {
        match self {
            Value::Int32(0) | Value::Int64(0) => true,
            Value::Float32(v) => *v == 0.0,
            Value::Float64(v) => *v == 0.0,
            _ => false,
        }
    }

    /// Total comparison used by filters and ORDER BY. Numerics compare across
    /// widths; NULL sorts before everything; values of unrelated types have
    /// no ordering.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) => {
                if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                    return Some(x.cmp(&y));
                }
                match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => Some(x.total_cmp(&y)),
                    _ => None,
                }
            }
        }
    }

    /// Equality with numeric coercion (`Int32(1)` matches `Int64(1)`).
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }

    /// Rough in-memory footprint, used by the buffer pool for accounting.
    pub fn size_bytes(&self) -> usize {
        match self {
            Value::Null => 1,
            Value::Bool(_) => 1,
            Value::Int32(_) | Value::Float32(_) => 4,
            Value::Int64(_) | Value::Float64(_) | Value::Timestamp(_) => 8,
            Value::String(s) => 24 + s.len(),
            Value::Bytes(b) => 24 + b.len(),
            Value::Vector(v) => 24 + v.len() * 4,
            Value::Array(items) => 24 + items.iter().map(Value::size_bytes).sum::<usize>(),
            Value::Map(entries) => {
                24 + entries
                    .iter()
                    .map(|(k, v)| 24 + k.len() + v.size_bytes())
                    .sum::<usize>()
            }
        }
    }

    /// Instant helper for the codec: microseconds since the Unix epoch.
    pub fn timestamp_from_micros(micros: i64) -> Value {
        match Utc.timestamp_micros(micros) {
            chrono::LocalResult::Single(ts) => Value::Timestamp(ts),
            _ => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else {
                    Value::Float64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Estimated footprint of a whole row, including key strings.
pub fn row_size_bytes(row: &Row) -> usize {
    row.iter().map(|(k, v)| 24 + k.len() + v.size_bytes()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert!(Value::Int32(1).loose_eq(&Value::Int64(1)));
        assert!(Value::Int64(2).loose_eq(&Value::Float64(2.0)));
        assert!(!Value::Int64(2).loose_eq(&Value::Float64(2.5)));
        assert_eq!(
            Value::Int32(3).compare(&Value::Int64(10)),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_null_ordering() {
        assert_eq!(
            Value::Null.compare(&Value::Int64(0)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Null.compare(&Value::Null), Some(Ordering::Equal));
    }

    #[test]
    fn test_incomparable_types() {
        assert_eq!(Value::String("a".into()).compare(&Value::Int64(1)), None);
    }

    #[test]
    fn test_from_json() {
        let json: serde_json::Value = serde_json::json!({"tags": ["keep_me"], "n": 7});
        let value = Value::from(json);
        match value {
            Value::Map(entries) => {
                assert_eq!(entries["n"], Value::Int64(7));
                assert_eq!(
                    entries["tags"],
                    Value::Array(vec![Value::String("keep_me".into())])
                );
            }
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_is_numeric_zero() {
        assert!(Value::Int64(0).is_numeric_zero());
        assert!(Value::Float64(0.0).is_numeric_zero());
        assert!(!Value::Int64(1).is_numeric_zero());
        assert!(!Value::Null.is_numeric_zero());
    }
}
