// Copy-on-write transactions.
//
// A snapshot pins, per table, the version that was latest at BEGIN. The
// workspace is lazy: no row state exists until the first mutation copies the
// schema and starts tracking row locks, copies, and tombstones. RowIDs are
// positional in the pinned base; rows appended by the transaction take ids
// past the base count.

use crate::common::{Row, RowId};
use crate::catalog::TableInfo;
use crate::error::DbError;
use crate::expr::GeneratedColumnEvaluator;
use crate::mvcc::{TableData, TableVersions};
use crate::query::Filter;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: u64,
    pub start_time: DateTime<Utc>,
    pub read_only: bool,
}

/// A transaction's view of the database: one COW snapshot per table that
/// existed at begin time.
pub struct Snapshot {
    pub transaction_id: u64,
    pub start_version: u64,
    pub created_at: DateTime<Utc>,
    tables: RwLock<HashMap<String, Arc<CowTableSnapshot>>>,
}

impl Snapshot {
    pub fn new(transaction_id: u64, start_version: u64, pins: Vec<(String, u64)>) -> Self {
        let tables = pins
            .into_iter()
            .map(|(name, version)| {
                let cow = Arc::new(CowTableSnapshot::new(name.clone(), version));
                (name, cow)
            })
            .collect();
        Self {
            transaction_id,
            start_version,
            created_at: Utc::now(),
            tables: RwLock::new(tables),
        }
    }

    pub fn table(&self, name: &str) -> Option<Arc<CowTableSnapshot>> {
        self.tables.read().get(name).cloned()
    }

    /// Workspace for a table created after BEGIN: pin it at its current
    /// latest on first touch.
    pub fn table_or_pin(&self, name: &str, latest: u64) -> Arc<CowTableSnapshot> {
        if let Some(existing) = self.table(name) {
            return existing;
        }
        let mut tables = self.tables.write();
        tables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CowTableSnapshot::new(name.to_string(), latest)))
            .clone()
    }

    /// (table, pinned version) pairs, for the version GC.
    pub fn pins(&self) -> Vec<(String, u64)> {
        self.tables
            .read()
            .iter()
            .map(|(name, cow)| (name.clone(), cow.pinned_version()))
            .collect()
    }

    /// Snapshots that carry uncommitted changes.
    pub fn modified_tables(&self) -> Vec<Arc<CowTableSnapshot>> {
        let mut modified: Vec<Arc<CowTableSnapshot>> = self
            .tables
            .read()
            .values()
            .filter(|cow| cow.has_modifications())
            .cloned()
            .collect();
        modified.sort_by(|a, b| a.table().cmp(b.table()));
        modified
    }
}

struct CowState {
    copied: bool,
    /// Pinned base data; set by `ensure_copied` and immutable afterwards.
    base: Option<Arc<TableData>>,
    /// Deep copy of the base schema.
    schema: Option<TableInfo>,
    /// RowIDs this transaction has written.
    row_locks: HashSet<RowId>,
    /// Modified and inserted rows, keyed by RowID.
    row_copies: HashMap<RowId, Row>,
    /// Tombstones.
    deleted_rows: HashSet<RowId>,
    /// Rows appended by this transaction.
    inserted_count: u64,
}

/// A modified or inserted row handed to the commit path.
pub struct ChangedRow {
    pub row: Row,
    /// The base row this change replaces; `None` for inserts.
    pub base: Option<Row>,
}

/// Everything the engine needs to publish a transaction's changes to one
/// table.
pub struct CommitPayload {
    pub schema: TableInfo,
    pub rows: Vec<Row>,
    pub changed: Vec<ChangedRow>,
}

pub struct CowTableSnapshot {
    table: String,
    pinned_version: u64,
    state: Mutex<CowState>,
}

impl CowTableSnapshot {
    pub fn new(table: String, pinned_version: u64) -> Self {
        Self {
            table,
            pinned_version,
            state: Mutex::new(CowState {
                copied: false,
                base: None,
                schema: None,
                row_locks: HashSet::new(),
                row_copies: HashMap::new(),
                deleted_rows: HashSet::new(),
                inserted_count: 0,
            }),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pinned_version(&self) -> u64 {
        self.pinned_version
    }

    pub fn is_copied(&self) -> bool {
        self.state.lock().copied
    }

    pub fn has_modifications(&self) -> bool {
        let st = self.state.lock();
        st.copied && (!st.row_copies.is_empty() || !st.deleted_rows.is_empty())
    }

    /// First-mutation hook: pin the base version and deep-copy its schema.
    /// The version lookup happens before the workspace lock is taken, per
    /// the lock hierarchy.
    pub fn ensure_copied(&self, versions: &TableVersions) -> Result<()> {
        if self.is_copied() {
            return Ok(());
        }
        let base = versions.get(self.pinned_version).ok_or_else(|| {
            DbError::Internal(format!(
                "pinned version {} of table {} is gone",
                self.pinned_version, self.table
            ))
        })?;
        let mut st = self.state.lock();
        if !st.copied {
            st.schema = Some(base.schema.clone());
            st.base = Some(base);
            st.copied = true;
        }
        Ok(())
    }

    /// Schema as seen by this transaction. Requires `ensure_copied`.
    pub fn schema(&self) -> Result<TableInfo> {
        self.state
            .lock()
            .schema
            .clone()
            .ok_or_else(|| DbError::Internal("workspace schema before ensure_copied".into()))
    }

    /// The rows this transaction sees: base rows minus tombstones with
    /// copies substituted, then its own inserts in RowID order.
    pub fn visible(&self, versions: &TableVersions) -> Result<(TableInfo, Vec<Row>)> {
        {
            let st = self.state.lock();
            if st.copied {
                return Self::merge(&st);
            }
        }
        let data = versions.get(self.pinned_version).ok_or_else(|| {
            DbError::Internal(format!(
                "pinned version {} of table {} is gone",
                self.pinned_version, self.table
            ))
        })?;
        // Re-check: another thread of this transaction may have copied in
        // the meantime.
        let st = self.state.lock();
        if st.copied {
            return Self::merge(&st);
        }
        Ok((data.schema.clone(), data.materialize()?))
    }

    fn merge(st: &CowState) -> Result<(TableInfo, Vec<Row>)> {
        let base = st
            .base
            .as_ref()
            .ok_or_else(|| DbError::Internal("copied workspace without base".into()))?;
        let schema = st
            .schema
            .clone()
            .ok_or_else(|| DbError::Internal("copied workspace without schema".into()))?;

        let base_count = base.rows.len() as RowId;
        let mut rows = Vec::with_capacity(base.rows.len() + st.inserted_count as usize);
        for i in 0..base.rows.len() {
            let row_id = i as RowId + 1;
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            match st.row_copies.get(&row_id) {
                Some(copy) => rows.push(copy.clone()),
                None => {
                    let row = base.rows.get(i)?.ok_or_else(|| {
                        DbError::Internal(format!("base row {} missing", row_id))
                    })?;
                    rows.push(row);
                }
            }
        }
        for row_id in (base_count + 1)..=(base_count + st.inserted_count) {
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            if let Some(row) = st.row_copies.get(&row_id) {
                rows.push(row.clone());
            }
        }
        Ok((schema, rows))
    }

    /// Append prepared rows. Requires `ensure_copied`.
    pub fn insert_rows(&self, rows: Vec<Row>) -> Result<usize> {
        let mut st = self.state.lock();
        if !st.copied {
            return Err(DbError::Internal("insert before ensure_copied".into()));
        }
        let base_count = st
            .base
            .as_ref()
            .map(|b| b.rows.len() as RowId)
            .unwrap_or(0);
        let count = rows.len();
        for row in rows {
            st.inserted_count += 1;
            let row_id = base_count + st.inserted_count;
            st.row_copies.insert(row_id, row);
            st.row_locks.insert(row_id);
        }
        Ok(count)
    }

    /// Update matching rows in place (copy-on-first-touch). Affected STORED
    /// generated columns are recomputed through the evaluator.
    pub fn update_rows(
        &self,
        filters: &[Filter],
        updates: &Row,
        evaluator: &dyn GeneratedColumnEvaluator,
    ) -> Result<usize> {
        let mut st = self.state.lock();
        if !st.copied {
            return Err(DbError::Internal("update before ensure_copied".into()));
        }
        let base = st.base.clone();
        let schema = st
            .schema
            .clone()
            .ok_or_else(|| DbError::Internal("copied workspace without schema".into()))?;
        let base_rows = base.as_ref().map(|b| b.rows.clone());
        let base_count = base_rows.as_ref().map(|r| r.len() as RowId).unwrap_or(0);
        let updated_columns: Vec<String> = updates.keys().cloned().collect();

        let mut affected = 0usize;
        for i in 0..base_count as usize {
            let row_id = i as RowId + 1;
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            let current = match st.row_copies.get(&row_id) {
                Some(copy) => copy.clone(),
                None => match base_rows.as_ref().and_then(|r| r.get(i).transpose()) {
                    Some(row) => row?,
                    None => continue,
                },
            };
            if !filters.iter().all(|f| f.matches(&current)) {
                continue;
            }
            let mut row = current;
            for (column, value) in updates {
                row.insert(column.clone(), value.clone());
            }
            evaluator.evaluate_affected(&mut row, &updated_columns, &schema)?;
            st.row_copies.insert(row_id, row);
            st.row_locks.insert(row_id);
            affected += 1;
        }

        for row_id in (base_count + 1)..=(base_count + st.inserted_count) {
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            let Some(current) = st.row_copies.get(&row_id).cloned() else {
                continue;
            };
            if !filters.iter().all(|f| f.matches(&current)) {
                continue;
            }
            let mut row = current;
            for (column, value) in updates {
                row.insert(column.clone(), value.clone());
            }
            evaluator.evaluate_affected(&mut row, &updated_columns, &schema)?;
            st.row_copies.insert(row_id, row);
            affected += 1;
        }
        Ok(affected)
    }

    /// Tombstone matching rows.
    pub fn delete_rows(&self, filters: &[Filter]) -> Result<usize> {
        let mut st = self.state.lock();
        if !st.copied {
            return Err(DbError::Internal("delete before ensure_copied".into()));
        }
        let base_rows = st.base.as_ref().map(|b| b.rows.clone());
        let base_count = base_rows.as_ref().map(|r| r.len() as RowId).unwrap_or(0);

        let mut affected = 0usize;
        for i in 0..base_count as usize {
            let row_id = i as RowId + 1;
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            let current = match st.row_copies.get(&row_id) {
                Some(copy) => copy.clone(),
                None => match base_rows.as_ref().and_then(|r| r.get(i).transpose()) {
                    Some(row) => row?,
                    None => continue,
                },
            };
            if !filters.iter().all(|f| f.matches(&current)) {
                continue;
            }
            st.deleted_rows.insert(row_id);
            st.row_copies.remove(&row_id);
            st.row_locks.remove(&row_id);
            affected += 1;
        }

        for row_id in (base_count + 1)..=(base_count + st.inserted_count) {
            if st.deleted_rows.contains(&row_id) {
                continue;
            }
            let Some(current) = st.row_copies.get(&row_id).cloned() else {
                continue;
            };
            if !filters.iter().all(|f| f.matches(&current)) {
                continue;
            }
            st.row_copies.remove(&row_id);
            st.deleted_rows.insert(row_id);
            affected += 1;
        }
        Ok(affected)
    }

    /// Build the commit slice: merged rows plus the changed-row list the
    /// unique-constraint check probes against committed state. `None` when
    /// the workspace holds no modifications.
    pub fn commit_payload(&self) -> Result<Option<CommitPayload>> {
        let st = self.state.lock();
        if !st.copied || (st.row_copies.is_empty() && st.deleted_rows.is_empty()) {
            return Ok(None);
        }
        let (schema, rows) = Self::merge(&st)?;

        let base = st
            .base
            .as_ref()
            .ok_or_else(|| DbError::Internal("copied workspace without base".into()))?;
        let base_count = base.rows.len() as RowId;

        let mut changed_ids: Vec<RowId> = st
            .row_copies
            .keys()
            .filter(|id| !st.deleted_rows.contains(id))
            .copied()
            .collect();
        changed_ids.sort_unstable();

        let mut changed = Vec::with_capacity(changed_ids.len());
        for row_id in changed_ids {
            let row = st.row_copies[&row_id].clone();
            let base_row = if row_id <= base_count {
                base.rows.get(row_id as usize - 1)?
            } else {
                None
            };
            changed.push(ChangedRow {
                row,
                base: base_row,
            });
        }
        Ok(Some(CommitPayload {
            schema,
            rows,
            changed,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::catalog::{ColumnInfo, DataType};
    use crate::common::Value;
    use crate::expr::NullEvaluator;
    use crate::storage::PagedRows;

    fn schema() -> TableInfo {
        TableInfo::new(
            "items",
            vec![
                ColumnInfo::new("id", DataType::Int64),
                ColumnInfo::new("value", DataType::String),
            ],
        )
    }

    fn row(id: i64, value: &str) -> Row {
        let mut r = Row::new();
        r.insert("id".to_string(), Value::Int64(id));
        r.insert("value".to_string(), Value::String(value.to_string()));
        r
    }

    fn versions_with_rows(rows: Vec<Row>) -> TableVersions {
        let pool = BufferPool::disabled();
        let tv = TableVersions::new("items");
        tv.publish(|_| {
            Ok(TableData::new(
                1,
                schema(),
                PagedRows::from_rows(&pool, "items", 1, rows),
            ))
        })
        .unwrap();
        tv
    }

    #[test]
    fn test_uncopied_reads_pinned_version() {
        let tv = versions_with_rows(vec![row(1, "original")]);
        let cow = CowTableSnapshot::new("items".to_string(), 1);

        assert!(!cow.is_copied());
        let (_, rows) = cow.visible(&tv).unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_insert_assigns_row_ids_past_base() {
        let tv = versions_with_rows(vec![row(1, "a"), row(2, "b")]);
        let cow = CowTableSnapshot::new("items".to_string(), 1);
        cow.ensure_copied(&tv).unwrap();

        cow.insert_rows(vec![row(3, "c")]).unwrap();
        let (_, rows) = cow.visible(&tv).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["id"], Value::Int64(3));

        let payload = cow.commit_payload().unwrap().unwrap();
        assert_eq!(payload.rows.len(), 3);
        assert_eq!(payload.changed.len(), 1);
        assert!(payload.changed[0].base.is_none());
    }

    #[test]
    fn test_update_copy_on_first_touch() {
        let tv = versions_with_rows(vec![row(1, "a"), row(2, "b")]);
        let cow = CowTableSnapshot::new("items".to_string(), 1);
        cow.ensure_copied(&tv).unwrap();

        let mut updates = Row::new();
        updates.insert("value".to_string(), Value::String("patched".to_string()));
        let n = cow
            .update_rows(
                &[Filter::eq("id", Value::Int64(2))],
                &updates,
                &NullEvaluator,
            )
            .unwrap();
        assert_eq!(n, 1);

        let (_, rows) = cow.visible(&tv).unwrap();
        assert_eq!(rows[1]["value"], Value::String("patched".to_string()));
        // Base version is untouched.
        assert_eq!(
            tv.latest().unwrap().materialize().unwrap()[1]["value"],
            Value::String("b".to_string())
        );
    }

    #[test]
    fn test_delete_base_and_inserted() {
        let tv = versions_with_rows(vec![row(1, "a")]);
        let cow = CowTableSnapshot::new("items".to_string(), 1);
        cow.ensure_copied(&tv).unwrap();
        cow.insert_rows(vec![row(2, "new")]).unwrap();

        let n = cow.delete_rows(&[]).unwrap();
        assert_eq!(n, 2);

        let (_, rows) = cow.visible(&tv).unwrap();
        assert!(rows.is_empty());

        // Deleting everything still counts as modifications (tombstones).
        assert!(cow.has_modifications());
        let payload = cow.commit_payload().unwrap().unwrap();
        assert!(payload.rows.is_empty());
        assert!(payload.changed.is_empty());
    }

    #[test]
    fn test_update_then_delete_clears_copy() {
        let tv = versions_with_rows(vec![row(1, "a")]);
        let cow = CowTableSnapshot::new("items".to_string(), 1);
        cow.ensure_copied(&tv).unwrap();

        let mut updates = Row::new();
        updates.insert("value".to_string(), Value::String("x".to_string()));
        cow.update_rows(&[], &updates, &NullEvaluator).unwrap();
        cow.delete_rows(&[]).unwrap();

        let payload = cow.commit_payload().unwrap().unwrap();
        assert!(payload.rows.is_empty());
        assert!(payload.changed.is_empty());
    }

    #[test]
    fn test_snapshot_pins() {
        let snapshot = Snapshot::new(7, 42, vec![("items".to_string(), 3)]);
        assert_eq!(snapshot.pins(), vec![("items".to_string(), 3)]);
        assert!(snapshot.table("items").is_some());
        assert!(snapshot.table("other").is_none());

        let pinned = snapshot.table_or_pin("other", 9);
        assert_eq!(pinned.pinned_version(), 9);
    }
}
