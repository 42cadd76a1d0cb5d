// Per-table index registries.
//
// Two parallel structures per table: general indexes by name (with a
// first-column map to accelerate planner lookups) and vector indexes by
// column. Rebuild clears and repopulates everything after a version is
// materialized, assigning RowID = position + 1.

use crate::catalog::TableInfo;
use crate::common::{Row, RowId};
use crate::error::DbError;
use crate::index::{
    BTreeIndex, FullTextIndex, HashIndex, Index, IndexInfo, IndexKey, IndexKind, RTreeIndex,
};
use crate::vector::VectorIndex;
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct TableIndexes {
    by_name: HashMap<String, Arc<dyn Index>>,
    by_first_column: HashMap<String, Arc<dyn Index>>,
    vector_by_column: HashMap<String, Arc<dyn VectorIndex>>,
}

#[derive(Default)]
pub struct IndexManager {
    tables: RwLock<HashMap<String, TableIndexes>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a general index. Composite columns are only supported on
    /// BTree and Hash; full-text and spatial are single-column.
    pub fn create_index(
        &self,
        table: &str,
        name: Option<String>,
        columns: Vec<String>,
        kind: IndexKind,
        unique: bool,
    ) -> Result<Arc<dyn Index>> {
        if columns.is_empty() {
            return Err(DbError::Validation("index requires at least one column".into()));
        }
        if kind.is_vector() {
            return Err(DbError::UnsupportedIndexKind(
                "vector indexes are created through create_vector_index".to_string(),
            ));
        }
        if columns.len() > 1 && !kind.supports_composite() {
            return Err(DbError::UnsupportedIndexKind(format!(
                "{:?} index does not support composite columns",
                kind
            )));
        }

        let name = name.unwrap_or_else(|| format!("idx_{}_{}", table, columns.join("_")));
        let info = IndexInfo {
            name: name.clone(),
            table: table.to_string(),
            columns: columns.clone(),
            kind,
            unique,
        };

        let index: Arc<dyn Index> = match kind {
            IndexKind::BTree => Arc::new(BTreeIndex::new(info)),
            IndexKind::Hash => Arc::new(HashIndex::new(info)),
            IndexKind::FullText => Arc::new(FullTextIndex::new(info)?),
            IndexKind::SpatialRTree => Arc::new(RTreeIndex::new(info)),
            IndexKind::VectorFlat | IndexKind::VectorHnsw => unreachable!(),
        };

        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        if entry.by_name.contains_key(&name) {
            return Err(DbError::DuplicateIndex(name));
        }
        entry.by_name.insert(name, index.clone());
        entry
            .by_first_column
            .entry(columns[0].clone())
            .or_insert_with(|| index.clone());
        debug!(table, index = %index.info().name, "created index");
        Ok(index)
    }

    /// Register a vector index under its column.
    pub fn register_vector_index(
        &self,
        table: &str,
        column: &str,
        index: Arc<dyn VectorIndex>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables.entry(table.to_string()).or_default();
        if entry.vector_by_column.contains_key(column) {
            return Err(DbError::DuplicateIndex(format!("{}.{}", table, column)));
        }
        entry.vector_by_column.insert(column.to_string(), index);
        Ok(())
    }

    /// Drop one index by name. Vector indexes are addressed by their column
    /// name.
    pub fn drop_index(&self, table: &str, name: &str) -> Result<()> {
        let mut tables = self.tables.write();
        let entry = tables
            .get_mut(table)
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;

        if let Some(index) = entry.by_name.remove(name) {
            index.close()?;
            let first = index.info().columns[0].clone();
            let replace = entry
                .by_first_column
                .get(&first)
                .map(|existing| Arc::ptr_eq(existing, &index))
                .unwrap_or(false);
            if replace {
                entry.by_first_column.remove(&first);
                // Another index on the same first column takes over the slot.
                if let Some(other) = entry
                    .by_name
                    .values()
                    .find(|i| i.info().columns[0] == first)
                {
                    entry.by_first_column.insert(first, other.clone());
                }
            }
            return Ok(());
        }
        if let Some(index) = entry.vector_by_column.remove(name) {
            index.close()?;
            return Ok(());
        }
        Err(DbError::IndexNotFound(name.to_string()))
    }

    pub fn get_index(&self, table: &str, name: &str) -> Option<Arc<dyn Index>> {
        self.tables.read().get(table)?.by_name.get(name).cloned()
    }

    /// Planner lookup: an index whose first column matches.
    pub fn index_for_column(&self, table: &str, column: &str) -> Option<Arc<dyn Index>> {
        self.tables
            .read()
            .get(table)?
            .by_first_column
            .get(column)
            .cloned()
    }

    pub fn vector_index(&self, table: &str, column: &str) -> Option<Arc<dyn VectorIndex>> {
        self.tables
            .read()
            .get(table)?
            .vector_by_column
            .get(column)
            .cloned()
    }

    pub fn list_indexes(&self, table: &str) -> Vec<IndexInfo> {
        let tables = self.tables.read();
        let Some(entry) = tables.get(table) else {
            return Vec::new();
        };
        let mut infos: Vec<IndexInfo> = entry.by_name.values().map(|i| i.info().clone()).collect();
        for (column, index) in &entry.vector_by_column {
            let config = index.config();
            infos.push(IndexInfo {
                name: config.name.clone(),
                table: table.to_string(),
                columns: vec![column.clone()],
                kind: config.kind,
                unique: false,
            });
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Unique general indexes on a table, for constraint checks.
    pub fn unique_indexes(&self, table: &str) -> Vec<Arc<dyn Index>> {
        let tables = self.tables.read();
        let Some(entry) = tables.get(table) else {
            return Vec::new();
        };
        entry
            .by_name
            .values()
            .filter(|i| i.info().unique)
            .cloned()
            .collect()
    }

    /// Clear every index on the table and repopulate it from `rows` with
    /// RowID = position + 1. Rows whose key cannot be extracted (missing or
    /// NULL column, unsupported type, wrong vector dimension) are skipped.
    pub fn rebuild(&self, table: &str, schema: &TableInfo, rows: &[Row]) -> Result<()> {
        let tables = self.tables.read();
        let Some(entry) = tables.get(table) else {
            return Ok(());
        };

        for index in entry.by_name.values() {
            index.reset()?;
            let columns = index.info().columns.clone();
            for (i, row) in rows.iter().enumerate() {
                let row_id = i as RowId + 1;
                match IndexKey::from_row(row, &columns, Some(schema)) {
                    Ok(Some(key)) => index.insert(&key, &[row_id])?,
                    Ok(None) => {}
                    Err(e) => {
                        warn!(table, index = %index.info().name, row_id, error = %e,
                            "skipping row during index rebuild");
                    }
                }
            }
        }

        for (column, index) in &entry.vector_by_column {
            index.reset()?;
            for (i, row) in rows.iter().enumerate() {
                let row_id = i as RowId + 1;
                let Some(vector) = row.get(column).and_then(|v| v.as_vector()) else {
                    continue;
                };
                if let Err(e) = index.insert(row_id, vector) {
                    warn!(table, column = %column, row_id, error = %e,
                        "skipping vector during index rebuild");
                }
            }
        }
        Ok(())
    }

    /// Close and remove every index for a table.
    pub fn drop_table_indexes(&self, table: &str) {
        let Some(entry) = self.tables.write().remove(table) else {
            return;
        };
        for index in entry.by_name.values() {
            if let Err(e) = index.close() {
                warn!(table, index = %index.info().name, error = %e, "index close failed");
            }
        }
        for index in entry.vector_by_column.values() {
            if let Err(e) = index.close() {
                warn!(table, error = %e, "vector index close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ColumnInfo, DataType};
    use crate::common::Value;

    fn schema() -> TableInfo {
        TableInfo::new(
            "users",
            vec![
                ColumnInfo::new("id", DataType::Int64).primary_key(),
                ColumnInfo::new("email", DataType::String).unique(),
                ColumnInfo::new("age", DataType::Int64),
            ],
        )
    }

    fn row(id: i64, email: &str, age: i64) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Int64(id));
        r.insert("email".to_string(), Value::String(email.to_string()));
        r.insert("age".to_string(), Value::Int64(age));
        r
    }

    #[test]
    fn test_create_and_lookup() {
        let mgr = IndexManager::new();
        mgr.create_index("users", None, vec!["age".to_string()], IndexKind::BTree, false)
            .unwrap();

        assert!(mgr.index_for_column("users", "age").is_some());
        assert!(mgr.index_for_column("users", "email").is_none());
        assert_eq!(mgr.list_indexes("users").len(), 1);
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let mgr = IndexManager::new();
        mgr.create_index(
            "users",
            Some("idx_a".to_string()),
            vec!["age".to_string()],
            IndexKind::BTree,
            false,
        )
        .unwrap();
        let err = mgr
            .create_index(
                "users",
                Some("idx_a".to_string()),
                vec!["age".to_string()],
                IndexKind::Hash,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DbError::DuplicateIndex(_)));
    }

    #[test]
    fn test_composite_only_on_btree_hash() {
        let mgr = IndexManager::new();
        let err = mgr
            .create_index(
                "users",
                None,
                vec!["a".to_string(), "b".to_string()],
                IndexKind::FullText,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, DbError::UnsupportedIndexKind(_)));
    }

    #[test]
    fn test_rebuild_assigns_positional_row_ids() {
        let mgr = IndexManager::new();
        let idx = mgr
            .create_index("users", None, vec!["email".to_string()], IndexKind::Hash, true)
            .unwrap();

        let rows = vec![row(1, "a@x", 30), row(2, "b@x", 22)];
        mgr.rebuild("users", &schema(), &rows).unwrap();

        let key = IndexKey::single(&Value::String("b@x".into())).unwrap();
        assert_eq!(idx.find(&key).unwrap(), vec![2]);

        // A rebuild with fewer rows drops stale entries.
        mgr.rebuild("users", &schema(), &rows[..1].to_vec()).unwrap();
        assert!(idx.find(&key).unwrap().is_empty());
    }

    #[test]
    fn test_drop_index() {
        let mgr = IndexManager::new();
        mgr.create_index(
            "users",
            Some("idx_age".to_string()),
            vec!["age".to_string()],
            IndexKind::BTree,
            false,
        )
        .unwrap();
        mgr.drop_index("users", "idx_age").unwrap();
        assert!(mgr.get_index("users", "idx_age").is_none());
        assert!(mgr.index_for_column("users", "age").is_none());
        assert!(matches!(
            mgr.drop_index("users", "idx_age"),
            Err(DbError::IndexNotFound(_))
        ));
    }

    #[test]
    fn test_unique_indexes_enumeration() {
        let mgr = IndexManager::new();
        mgr.create_index("users", None, vec!["email".to_string()], IndexKind::Hash, true)
            .unwrap();
        mgr.create_index("users", None, vec!["age".to_string()], IndexKind::BTree, false)
            .unwrap();
        let unique = mgr.unique_indexes("users");
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].info().columns, vec!["email".to_string()]);
    }
}
