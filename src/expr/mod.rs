// Generated-column collaborators.
//
// Expression evaluation itself lives outside the engine; these traits are
// the seam. Everything that is pure schema work (which columns are
// generated, which are virtual, dependency ordering) has default
// implementations so an evaluator only supplies `evaluate`.

use crate::catalog::{GeneratedKind, TableInfo};
use crate::common::{Row, Value};
use crate::Result;
use std::collections::HashSet;
use std::sync::Arc;

/// Evaluates generated-column expressions against a row.
pub trait GeneratedColumnEvaluator: Send + Sync {
    /// Evaluate one expression. The row carries the dependency values.
    fn evaluate(&self, expression: &str, row: &Row, schema: &TableInfo) -> Result<Value>;

    /// Compute every STORED generated column into the row, in dependency
    /// order (the schema was validated acyclic at CREATE TABLE).
    fn evaluate_all(&self, row: &mut Row, schema: &TableInfo) -> Result<()> {
        for column in generated_in_dependency_order(schema) {
            let Some(generated) = &column.generated else { continue };
            if generated.kind != GeneratedKind::Stored {
                continue;
            }
            let value = self
                .evaluate(&generated.expression, row, schema)
                .unwrap_or(Value::Null);
            row.insert(column.name.clone(), value);
        }
        Ok(())
    }

    /// Recompute the generated columns affected by an update to `columns`,
    /// directly or transitively.
    fn evaluate_affected(&self, row: &mut Row, columns: &[String], schema: &TableInfo) -> Result<()> {
        let affected = self.affected_generated_columns(columns, schema);
        for column in generated_in_dependency_order(schema) {
            if !affected.contains(&column.name) {
                continue;
            }
            let Some(generated) = &column.generated else { continue };
            if generated.kind != GeneratedKind::Stored {
                continue;
            }
            let value = self
                .evaluate(&generated.expression, row, schema)
                .unwrap_or(Value::Null);
            row.insert(column.name.clone(), value);
        }
        Ok(())
    }

    /// Generated columns whose dependency closure intersects `updated`.
    fn affected_generated_columns(&self, updated: &[String], schema: &TableInfo) -> Vec<String> {
        let mut dirty: HashSet<&str> = updated.iter().map(String::as_str).collect();
        let mut affected = Vec::new();
        // Dependency order guarantees a single pass reaches the closure.
        for column in generated_in_dependency_order(schema) {
            let Some(generated) = &column.generated else { continue };
            if generated.depends_on.iter().any(|d| dirty.contains(d.as_str())) {
                dirty.insert(column.name.as_str());
                affected.push(column.name.clone());
            }
        }
        affected
    }

    /// Strip caller-supplied values for generated columns; callers may not
    /// set them.
    fn filter_generated_columns(&self, row: &mut Row, schema: &TableInfo) {
        for column in &schema.columns {
            if column.generated.is_some() {
                row.remove(&column.name);
            }
        }
    }

    fn is_virtual_column(&self, name: &str, schema: &TableInfo) -> bool {
        schema.column(name).map(|c| c.is_virtual()).unwrap_or(false)
    }

    fn set_generated_columns_null(&self, row: &mut Row, schema: &TableInfo) {
        for column in &schema.columns {
            if column.generated.is_some() {
                row.insert(column.name.clone(), Value::Null);
            }
        }
    }
}

/// Computes VIRTUAL columns on the read path.
pub trait VirtualColumnCalculator: Send + Sync {
    fn has_virtual_columns(&self, schema: &TableInfo) -> bool {
        schema.has_virtual_columns()
    }

    /// Fill virtual columns for a batch of rows. A failed expression leaves
    /// NULL in that column; the batch itself never fails.
    fn calculate_batch(&self, rows: &mut [Row], schema: &TableInfo) -> Result<()>;
}

/// Evaluator that resolves every expression to NULL. The engine default: it
/// keeps the generated-column bookkeeping exact while leaving real
/// expression semantics to the integrating layer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEvaluator;

impl GeneratedColumnEvaluator for NullEvaluator {
    fn evaluate(&self, _expression: &str, _row: &Row, _schema: &TableInfo) -> Result<Value> {
        Ok(Value::Null)
    }
}

/// Virtual-column calculator backed by a generated-column evaluator.
pub struct EvaluatorVirtuals {
    evaluator: Arc<dyn GeneratedColumnEvaluator>,
}

impl EvaluatorVirtuals {
    pub fn new(evaluator: Arc<dyn GeneratedColumnEvaluator>) -> Self {
        Self { evaluator }
    }
}

impl VirtualColumnCalculator for EvaluatorVirtuals {
    fn calculate_batch(&self, rows: &mut [Row], schema: &TableInfo) -> Result<()> {
        let virtuals: Vec<_> = schema
            .columns
            .iter()
            .filter(|c| c.is_virtual())
            .collect();
        if virtuals.is_empty() {
            return Ok(());
        }
        for row in rows.iter_mut() {
            for column in &virtuals {
                let Some(generated) = &column.generated else { continue };
                let value = self
                    .evaluator
                    .evaluate(&generated.expression, row, schema)
                    .unwrap_or(Value::Null);
                row.insert(column.name.clone(), value);
            }
        }
        Ok(())
    }
}

/// Generated columns ordered so dependencies come before dependents.
fn generated_in_dependency_order(schema: &TableInfo) -> Vec<&crate::catalog::ColumnInfo> {
    let generated: Vec<_> = schema.columns.iter().filter(|c| c.generated.is_some()).collect();
    let mut ordered: Vec<&crate::catalog::ColumnInfo> = Vec::with_capacity(generated.len());
    let mut placed: HashSet<&str> = HashSet::new();

    // Bounded iteration; the schema was validated acyclic.
    for _ in 0..generated.len() {
        for &column in &generated {
            if placed.contains(column.name.as_str()) {
                continue;
            }
            let deps_ready = column
                .generated
                .as_ref()
                .map(|g| {
                    g.depends_on.iter().all(|d| {
                        placed.contains(d.as_str())
                            || schema.column(d).map(|c| c.generated.is_none()).unwrap_or(true)
                    })
                })
                .unwrap_or(true);
            if deps_ready {
                placed.insert(column.name.as_str());
                ordered.push(column);
            }
        }
        if ordered.len() == generated.len() {
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnInfo, DataType, GeneratedKind};
    use crate::error::DbError;

    /// Test evaluator: "<col> * 2" doubles an integer column.
    struct DoublingEvaluator;

    impl GeneratedColumnEvaluator for DoublingEvaluator {
        fn evaluate(&self, expression: &str, row: &Row, _schema: &TableInfo) -> Result<Value> {
            let column = expression
                .strip_suffix(" * 2")
                .ok_or_else(|| DbError::Internal(format!("bad expression {}", expression)))?;
            let base = row.get(column).and_then(Value::as_i64).unwrap_or(0);
            Ok(Value::Int64(base * 2))
        }
    }

    fn schema() -> TableInfo {
        TableInfo::new(
            "t",
            vec![
                ColumnInfo::new("a", DataType::Int64),
                ColumnInfo::new("double_a", DataType::Int64).generated(
                    GeneratedKind::Stored,
                    "a * 2",
                    vec!["a".into()],
                ),
                ColumnInfo::new("quad_a", DataType::Int64).generated(
                    GeneratedKind::Stored,
                    "double_a * 2",
                    vec!["double_a".into()],
                ),
                ColumnInfo::new("view_a", DataType::Int64).generated(
                    GeneratedKind::Virtual,
                    "a * 2",
                    vec!["a".into()],
                ),
            ],
        )
    }

    #[test]
    fn test_evaluate_all_follows_dependencies() {
        let schema = schema();
        let mut row = Row::new();
        row.insert("a".to_string(), Value::Int64(3));

        DoublingEvaluator.evaluate_all(&mut row, &schema).unwrap();
        assert_eq!(row["double_a"], Value::Int64(6));
        assert_eq!(row["quad_a"], Value::Int64(12));
        // VIRTUAL columns are never stored.
        assert!(!row.contains_key("view_a"));
    }

    #[test]
    fn test_affected_closure() {
        let schema = schema();
        let affected = DoublingEvaluator.affected_generated_columns(&["a".to_string()], &schema);
        assert!(affected.contains(&"double_a".to_string()));
        assert!(affected.contains(&"quad_a".to_string()));
        assert!(affected.contains(&"view_a".to_string()));
    }

    #[test]
    fn test_filter_strips_caller_values() {
        let schema = schema();
        let mut row = Row::new();
        row.insert("a".to_string(), Value::Int64(1));
        row.insert("double_a".to_string(), Value::Int64(999));

        DoublingEvaluator.filter_generated_columns(&mut row, &schema);
        assert!(!row.contains_key("double_a"));
        assert!(row.contains_key("a"));
    }

    #[test]
    fn test_virtual_batch() {
        let schema = schema();
        let calc = EvaluatorVirtuals::new(Arc::new(DoublingEvaluator));
        let mut rows = vec![{
            let mut r = Row::new();
            r.insert("a".to_string(), Value::Int64(5));
            r
        }];
        calc.calculate_batch(&mut rows, &schema).unwrap();
        assert_eq!(rows[0]["view_a"], Value::Int64(10));
    }

    #[test]
    fn test_null_evaluator() {
        let schema = schema();
        let mut row = Row::new();
        row.insert("a".to_string(), Value::Int64(1));
        NullEvaluator.evaluate_all(&mut row, &schema).unwrap();
        assert_eq!(row["double_a"], Value::Null);
    }
}
