// Per-table version chains.
//
// Every published change installs a complete, immutable `TableData` under a
// new version number. Schema and row storage are deep-copied per version;
// readers hold an Arc to the version they started on.

use crate::catalog::TableInfo;
use crate::common::Row;
use crate::storage::PagedRows;
use crate::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// One immutable version of a table.
pub struct TableData {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub schema: TableInfo,
    pub rows: Arc<PagedRows>,
}

impl TableData {
    pub fn new(version: u64, schema: TableInfo, rows: Arc<PagedRows>) -> Self {
        Self {
            version,
            created_at: Utc::now(),
            schema,
            rows,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn materialize(&self) -> Result<Vec<Row>> {
        self.rows.to_vec()
    }
}

struct VersionsInner {
    versions: HashMap<u64, Arc<TableData>>,
    latest: u64,
}

/// The version chain of one table. The inner lock is the per-table version
/// lock of the lock hierarchy.
pub struct TableVersions {
    name: String,
    inner: RwLock<VersionsInner>,
}

impl TableVersions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(VersionsInner {
                versions: HashMap::new(),
                latest: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn latest_version(&self) -> u64 {
        self.inner.read().latest
    }

    pub fn latest(&self) -> Option<Arc<TableData>> {
        let inner = self.inner.read();
        inner.versions.get(&inner.latest).cloned()
    }

    pub fn get(&self, version: u64) -> Option<Arc<TableData>> {
        self.inner.read().versions.get(&version).cloned()
    }

    pub fn version_count(&self) -> usize {
        self.inner.read().versions.len()
    }

    /// Install a new version under the table lock. The closure builds the
    /// data from the current latest; an error aborts without publishing.
    pub fn publish<F>(&self, f: F) -> Result<Arc<TableData>>
    where
        F: FnOnce(Option<&Arc<TableData>>) -> Result<TableData>,
    {
        self.try_publish(|base| f(base).map(Some))?
            .ok_or_else(|| crate::error::DbError::Internal("publish produced no version".into()))
    }

    /// Like `publish`, but the closure may decide against installing (e.g.
    /// an update that matched no rows). Nothing changes on `Ok(None)`.
    pub fn try_publish<F>(&self, f: F) -> Result<Option<Arc<TableData>>>
    where
        F: FnOnce(Option<&Arc<TableData>>) -> Result<Option<TableData>>,
    {
        let mut inner = self.inner.write();
        let base = inner.versions.get(&inner.latest).cloned();
        let Some(data) = f(base.as_ref())? else {
            return Ok(None);
        };
        let data = Arc::new(data);
        debug!(table = %self.name, version = data.version, rows = data.row_count(), "published version");
        inner.latest = data.version;
        inner.versions.insert(data.version, data.clone());
        Ok(Some(data))
    }

    /// Drop versions that are below `min_required`, not `latest`, and not in
    /// the pinned set. Returns the removed versions so the caller can
    /// release their paged rows.
    pub fn gc(&self, min_required: u64, pinned: &HashSet<u64>) -> Vec<Arc<TableData>> {
        let mut inner = self.inner.write();
        let latest = inner.latest;
        let doomed: Vec<u64> = inner
            .versions
            .keys()
            .filter(|&&v| v < min_required && v != latest && !pinned.contains(&v))
            .copied()
            .collect();
        doomed
            .into_iter()
            .filter_map(|v| inner.versions.remove(&v))
            .collect()
    }

    /// Remove and return every version, for table drop.
    pub fn drain(&self) -> Vec<Arc<TableData>> {
        let mut inner = self.inner.write();
        inner.latest = 0;
        inner.versions.drain().map(|(_, data)| data).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::catalog::{ColumnInfo, DataType};
    use crate::common::Value;

    fn schema() -> TableInfo {
        TableInfo::new("t", vec![ColumnInfo::new("id", DataType::Int64)])
    }

    fn data(pool: &Arc<BufferPool>, version: u64, ids: &[i64]) -> TableData {
        let rows: Vec<Row> = ids
            .iter()
            .map(|&id| {
                let mut r = Row::new();
                r.insert("id".to_string(), Value::Int64(id));
                r
            })
            .collect();
        TableData::new(
            version,
            schema(),
            PagedRows::from_rows(pool, "t", version, rows),
        )
    }

    #[test]
    fn test_publish_advances_latest() {
        let pool = BufferPool::disabled();
        let tv = TableVersions::new("t");
        tv.publish(|_| Ok(data(&pool, 1, &[1]))).unwrap();
        tv.publish(|base| {
            assert_eq!(base.unwrap().version, 1);
            Ok(data(&pool, 2, &[1, 2]))
        })
        .unwrap();

        assert_eq!(tv.latest_version(), 2);
        assert_eq!(tv.latest().unwrap().row_count(), 2);
        assert_eq!(tv.get(1).unwrap().row_count(), 1);
    }

    #[test]
    fn test_publish_error_leaves_latest() {
        let pool = BufferPool::disabled();
        let tv = TableVersions::new("t");
        tv.publish(|_| Ok(data(&pool, 1, &[1]))).unwrap();
        let result = tv.publish(|_| {
            Err(crate::error::DbError::Internal("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(tv.latest_version(), 1);
    }

    #[test]
    fn test_gc_respects_latest_and_pins() {
        let pool = BufferPool::disabled();
        let tv = TableVersions::new("t");
        for v in 1..=4 {
            tv.publish(|_| Ok(data(&pool, v, &[v as i64]))).unwrap();
        }

        let pinned: HashSet<u64> = [2].into_iter().collect();
        let removed = tv.gc(10, &pinned);
        let removed_versions: HashSet<u64> = removed.iter().map(|d| d.version).collect();

        assert_eq!(removed_versions, [1, 3].into_iter().collect());
        assert!(tv.get(2).is_some());
        assert!(tv.get(4).is_some());
        for data in removed {
            data.rows.release();
        }
    }
}
