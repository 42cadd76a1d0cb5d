// Secondary indexes.
//
// All general index kinds implement the sealed `Index` capability; the query
// planner and the unique-constraint checks only ever talk to that trait.
// Vector indexes have their own capability in `crate::vector`.

pub mod btree;
pub mod fulltext;
pub mod hash;
pub mod manager;
pub mod rtree;

pub use btree::BTreeIndex;
pub use fulltext::{build_analyzer, register_analyzer, Analyzer, FullTextIndex, StandardAnalyzer};
pub use hash::HashIndex;
pub use manager::IndexManager;
pub use rtree::RTreeIndex;

use crate::catalog::{DataType, TableInfo};
use crate::common::{Row, RowId, Value};
use crate::error::DbError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index kinds known to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    BTree,
    Hash,
    FullText,
    SpatialRTree,
    VectorFlat,
    VectorHnsw,
}

impl IndexKind {
    pub fn is_vector(&self) -> bool {
        matches!(self, IndexKind::VectorFlat | IndexKind::VectorHnsw)
    }

    /// Only BTree and Hash support composite keys.
    pub fn supports_composite(&self) -> bool {
        matches!(self, IndexKind::BTree | IndexKind::Hash)
    }
}

/// Descriptor of one index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub kind: IndexKind,
    pub unique: bool,
}

/// General index capability. Range queries are only defined on ordered and
/// spatial kinds; the others return `UnsupportedOperation`.
pub trait Index: Send + Sync {
    fn info(&self) -> &IndexInfo;

    /// Add row ids under a key. Existing postings for the key are extended.
    fn insert(&self, key: &IndexKey, row_ids: &[RowId]) -> Result<()>;

    /// Remove a key and all its postings.
    fn delete(&self, key: &IndexKey) -> Result<()>;

    /// Point lookup.
    fn find(&self, key: &IndexKey) -> Result<Vec<RowId>>;

    /// Inclusive range lookup.
    fn find_range(&self, min: &IndexKey, max: &IndexKey) -> Result<Vec<RowId>>;

    /// Clear all entries. Used by the rebuild path after a version is
    /// materialized.
    fn reset(&self) -> Result<()>;

    /// Release resources. Default is a no-op.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").field("info", self.info()).finish()
    }
}

/// f64 wrapper with total ordering and bit-level hashing so float key parts
/// can live in ordered and hashed containers.
#[derive(Debug, Clone, Copy)]
pub struct OrderedF64(pub f64);

impl PartialEq for OrderedF64 {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == std::cmp::Ordering::Equal
    }
}

impl Eq for OrderedF64 {}

impl PartialOrd for OrderedF64 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedF64 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl std::hash::Hash for OrderedF64 {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// One component of a normalized index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyPart {
    Bool(bool),
    Int(i64),
    Float(OrderedF64),
    Str(String),
    Bytes(Vec<u8>),
    /// Microseconds since the Unix epoch.
    Time(i64),
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Bool(b) => write!(f, "{}", b),
            KeyPart::Int(v) => write!(f, "{}", v),
            KeyPart::Float(v) => write!(f, "{}", v.0),
            KeyPart::Str(s) => write!(f, "{}", s),
            KeyPart::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
            KeyPart::Time(t) => write!(f, "@{}", t),
        }
    }
}

impl KeyPart {
    /// Natural mapping from a scalar value. Vector, array, and map values
    /// are handled at the `IndexKey` level or rejected.
    fn from_scalar(value: &Value) -> Result<KeyPart> {
        match value {
            Value::Bool(b) => Ok(KeyPart::Bool(*b)),
            Value::Int32(v) => Ok(KeyPart::Int(*v as i64)),
            Value::Int64(v) => Ok(KeyPart::Int(*v)),
            Value::Float32(v) => Ok(KeyPart::Float(OrderedF64(*v as f64))),
            Value::Float64(v) => Ok(KeyPart::Float(OrderedF64(*v))),
            Value::String(s) => Ok(KeyPart::Str(s.clone())),
            Value::Bytes(b) => Ok(KeyPart::Bytes(b.clone())),
            Value::Timestamp(ts) => Ok(KeyPart::Time(ts.timestamp_micros())),
            other => Err(DbError::UnsupportedKeyType(other.type_name().to_string())),
        }
    }

    /// Mapping coerced through the column's declared type, so `Int64(1)` and
    /// `Float64(1.0)` land on the same key in a numeric column.
    fn from_scalar_as(value: &Value, data_type: DataType) -> Result<KeyPart> {
        match data_type {
            DataType::Int32 | DataType::Int64 => {
                if let Some(v) = value.as_i64() {
                    return Ok(KeyPart::Int(v));
                }
                if let Some(v) = value.as_f64() {
                    if v.fract() == 0.0 {
                        return Ok(KeyPart::Int(v as i64));
                    }
                }
                KeyPart::from_scalar(value)
            }
            DataType::Float32 | DataType::Float64 => {
                if let Some(v) = value.as_f64() {
                    return Ok(KeyPart::Float(OrderedF64(v)));
                }
                KeyPart::from_scalar(value)
            }
            _ => KeyPart::from_scalar(value),
        }
    }
}

/// Normalized, ordered, hashable index key. Composite keys tuple the column
/// values; top-level arrays and vectors flatten into numeric parts (this is
/// how spatial boxes travel through the general contract).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(pub Vec<KeyPart>);

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("-"))
    }
}

impl IndexKey {
    pub fn from_values(values: &[Value]) -> Result<Self> {
        Self::from_values_typed(values, &[])
    }

    /// Build a key from values, coercing each through the matching declared
    /// type when one is supplied.
    pub fn from_values_typed(values: &[Value], types: &[Option<DataType>]) -> Result<Self> {
        let mut parts = Vec::with_capacity(values.len());
        for (i, value) in values.iter().enumerate() {
            let declared = types.get(i).copied().flatten();
            match value {
                Value::Array(items) => {
                    for item in items {
                        parts.push(KeyPart::from_scalar(item)?);
                    }
                }
                Value::Vector(v) => {
                    for f in v {
                        parts.push(KeyPart::Float(OrderedF64(*f as f64)));
                    }
                }
                other => parts.push(match declared {
                    Some(dt) => KeyPart::from_scalar_as(other, dt)?,
                    None => KeyPart::from_scalar(other)?,
                }),
            }
        }
        Ok(IndexKey(parts))
    }

    pub fn single(value: &Value) -> Result<Self> {
        Self::from_values(std::slice::from_ref(value))
    }

    /// Extract the key for `columns` from a row. Returns `None` when any
    /// component is missing or NULL (NULL never indexes).
    pub fn from_row(
        row: &Row,
        columns: &[String],
        schema: Option<&TableInfo>,
    ) -> Result<Option<Self>> {
        let mut values = Vec::with_capacity(columns.len());
        let mut types = Vec::with_capacity(columns.len());
        for column in columns {
            match row.get(column) {
                None | Some(Value::Null) => return Ok(None),
                Some(value) => {
                    values.push(value.clone());
                    types.push(schema.and_then(|s| s.column(column)).map(|c| c.data_type));
                }
            }
        }
        Ok(Some(Self::from_values_typed(&values, &types)?))
    }

    /// All parts as f64, for spatial keys.
    pub fn as_f64_parts(&self) -> Option<Vec<f64>> {
        self.0
            .iter()
            .map(|p| match p {
                KeyPart::Int(v) => Some(*v as f64),
                KeyPart::Float(v) => Some(v.0),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_ordering() {
        let a = IndexKey::from_values(&[Value::Int64(1), Value::String("b".into())]).unwrap();
        let b = IndexKey::from_values(&[Value::Int64(1), Value::String("c".into())]).unwrap();
        let c = IndexKey::from_values(&[Value::Int64(2), Value::String("a".into())]).unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_numeric_coercion_through_declared_type() {
        let as_int = IndexKey::from_values_typed(
            &[Value::Float64(5.0)],
            &[Some(DataType::Int64)],
        )
        .unwrap();
        let native = IndexKey::from_values(&[Value::Int64(5)]).unwrap();
        assert_eq!(as_int, native);
    }

    #[test]
    fn test_unsupported_key_type() {
        let err = IndexKey::from_values(&[Value::Map(Default::default())]).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedKeyType(_)));
    }

    #[test]
    fn test_array_flattens() {
        let key =
            IndexKey::from_values(&[Value::Array(vec![Value::Float64(1.0), Value::Float64(2.0)])])
                .unwrap();
        assert_eq!(key.0.len(), 2);
        assert_eq!(key.as_f64_parts(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn test_null_never_indexes() {
        let mut row = Row::new();
        row.insert("a".to_string(), Value::Null);
        let key = IndexKey::from_row(&row, &["a".to_string()], None).unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn test_display_for_duplicate_messages() {
        let key = IndexKey::from_values(&[Value::String("a@x".into())]).unwrap();
        assert_eq!(key.to_string(), "a@x");
    }
}
