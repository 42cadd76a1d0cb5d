// Table and column metadata.
//
// Schemas are plain data: they are deep-copied into every table version so
// mutating one version never affects another. Validation happens once at
// CREATE TABLE time.

use crate::common::Value;
use crate::error::DbError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Declared semantic type of a column.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Bytes,
    Timestamp,
    Vector,
    Array,
    Map,
}

/// How a generated column is materialized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum GeneratedKind {
    /// Computed on write and stored with the row.
    Stored,
    /// Computed on read, never stored.
    Virtual,
}

/// Generated-column metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedColumn {
    pub kind: GeneratedKind,
    pub expression: String,
    /// Columns the expression reads.
    pub depends_on: Vec<String>,
}

/// Foreign-key reference. Metadata only; the engine does not enforce it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// Column definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub default: Option<Value>,
    pub auto_increment: bool,
    pub foreign_key: Option<ForeignKeyRef>,
    pub generated: Option<GeneratedColumn>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            primary_key: false,
            unique: false,
            default: None,
            auto_increment: false,
            foreign_key: None,
            generated: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn generated(mut self, kind: GeneratedKind, expression: impl Into<String>, depends_on: Vec<String>) -> Self {
        self.generated = Some(GeneratedColumn {
            kind,
            expression: expression.into(),
            depends_on,
        });
        self
    }

    pub fn is_virtual(&self) -> bool {
        matches!(
            self.generated,
            Some(GeneratedColumn {
                kind: GeneratedKind::Virtual,
                ..
            })
        )
    }

    pub fn is_stored_generated(&self) -> bool {
        matches!(
            self.generated,
            Some(GeneratedColumn {
                kind: GeneratedKind::Stored,
                ..
            })
        )
    }
}

/// Table schema plus engine-internal attributes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub schema_name: String,
    pub columns: Vec<ColumnInfo>,
    pub temporary: bool,
    /// Attribute bag for engine-internal metadata.
    pub attributes: HashMap<String, String>,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            schema_name: "default".to_string(),
            columns,
            temporary: false,
            attributes: HashMap::new(),
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_virtual_columns(&self) -> bool {
        self.columns.iter().any(ColumnInfo::is_virtual)
    }

    /// Validate the schema. Checks duplicate column names and the
    /// generated-column dependency graph (references must exist, no cycles,
    /// generated columns cannot auto-increment).
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for column in &self.columns {
            if !seen.insert(column.name.as_str()) {
                return Err(DbError::Validation(format!(
                    "duplicate column name: {}",
                    column.name
                )));
            }
        }

        for column in &self.columns {
            let Some(generated) = &column.generated else {
                continue;
            };
            if column.auto_increment {
                return Err(DbError::InvalidGeneratedColumn(format!(
                    "column {} cannot be both generated and auto-increment",
                    column.name
                )));
            }
            for dep in &generated.depends_on {
                if self.column(dep).is_none() {
                    return Err(DbError::InvalidGeneratedColumn(format!(
                        "column {} depends on unknown column {}",
                        column.name, dep
                    )));
                }
            }
        }

        self.check_generated_cycles()
    }

    /// DFS over generated-column dependencies; a back edge is a cycle.
    fn check_generated_cycles(&self) -> Result<()> {
        let deps: HashMap<&str, &[String]> = self
            .columns
            .iter()
            .filter_map(|c| {
                c.generated
                    .as_ref()
                    .map(|g| (c.name.as_str(), g.depends_on.as_slice()))
            })
            .collect();

        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();

        fn visit<'a>(
            name: &'a str,
            deps: &HashMap<&'a str, &'a [String]>,
            state: &mut HashMap<&'a str, u8>,
        ) -> bool {
            match state.get(name) {
                Some(1) => return false,
                Some(2) => return true,
                _ => {}
            }
            state.insert(name, 1);
            if let Some(children) = deps.get(name) {
                for child in children.iter() {
                    if !visit(child.as_str(), deps, state) {
                        return false;
                    }
                }
            }
            state.insert(name, 2);
            true
        }

        for &name in deps.keys() {
            if !visit(name, &deps, &mut state) {
                return Err(DbError::InvalidGeneratedColumn(format!(
                    "cyclic generated-column dependency involving {}",
                    name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableInfo {
        TableInfo::new(
            "users",
            vec![
                ColumnInfo::new("id", DataType::Int64).primary_key(),
                ColumnInfo::new("name", DataType::String),
                ColumnInfo::new("age", DataType::Int64),
            ],
        )
    }

    #[test]
    fn test_validate_ok() {
        assert!(users_schema().validate().is_ok());
    }

    #[test]
    fn test_duplicate_column() {
        let schema = TableInfo::new(
            "t",
            vec![
                ColumnInfo::new("a", DataType::Int64),
                ColumnInfo::new("a", DataType::String),
            ],
        );
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_generated_cycle_detected() {
        let schema = TableInfo::new(
            "t",
            vec![
                ColumnInfo::new("a", DataType::Int64).generated(
                    GeneratedKind::Stored,
                    "b + 1",
                    vec!["b".into()],
                ),
                ColumnInfo::new("b", DataType::Int64).generated(
                    GeneratedKind::Stored,
                    "a + 1",
                    vec!["a".into()],
                ),
            ],
        );
        assert!(matches!(
            schema.validate(),
            Err(DbError::InvalidGeneratedColumn(_))
        ));
    }

    #[test]
    fn test_generated_unknown_dependency() {
        let schema = TableInfo::new(
            "t",
            vec![ColumnInfo::new("a", DataType::Int64).generated(
                GeneratedKind::Virtual,
                "missing * 2",
                vec!["missing".into()],
            )],
        );
        assert!(matches!(
            schema.validate(),
            Err(DbError::InvalidGeneratedColumn(_))
        ));
    }

    #[test]
    fn test_virtual_flag() {
        let col = ColumnInfo::new("v", DataType::Int64).generated(
            GeneratedKind::Virtual,
            "a * 2",
            vec!["a".into()],
        );
        assert!(col.is_virtual());
        assert!(!col.is_stored_generated());
    }
}
