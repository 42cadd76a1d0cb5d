// Unordered point-lookup index over normalized keys.

use crate::common::RowId;
use crate::error::DbError;
use crate::index::{Index, IndexInfo, IndexKey};
use crate::Result;
use parking_lot::RwLock;
use std::collections::HashMap;

pub struct HashIndex {
    info: IndexInfo,
    buckets: RwLock<HashMap<IndexKey, Vec<RowId>>>,
}

impl HashIndex {
    pub fn new(info: IndexInfo) -> Self {
        Self {
            info,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }
}

impl Index for HashIndex {
    fn info(&self) -> &IndexInfo {
        &self.info
    }

    fn insert(&self, key: &IndexKey, row_ids: &[RowId]) -> Result<()> {
        self.buckets
            .write()
            .entry(key.clone())
            .or_default()
            .extend_from_slice(row_ids);
        Ok(())
    }

    fn delete(&self, key: &IndexKey) -> Result<()> {
        self.buckets.write().remove(key);
        Ok(())
    }

    fn find(&self, key: &IndexKey) -> Result<Vec<RowId>> {
        Ok(self.buckets.read().get(key).cloned().unwrap_or_default())
    }

    fn find_range(&self, _min: &IndexKey, _max: &IndexKey) -> Result<Vec<RowId>> {
        Err(DbError::UnsupportedOperation(
            "range query not supported on hash index".to_string(),
        ))
    }

    fn reset(&self) -> Result<()> {
        self.buckets.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::index::IndexKind;

    fn index() -> HashIndex {
        HashIndex::new(IndexInfo {
            name: "idx_email".to_string(),
            table: "users".to_string(),
            columns: vec!["email".to_string()],
            kind: IndexKind::Hash,
            unique: true,
        })
    }

    #[test]
    fn test_point_lookup() {
        let idx = index();
        let key = IndexKey::single(&Value::String("a@x".into())).unwrap();
        idx.insert(&key, &[7]).unwrap();
        assert_eq!(idx.find(&key).unwrap(), vec![7]);

        idx.delete(&key).unwrap();
        assert!(idx.find(&key).unwrap().is_empty());
    }

    #[test]
    fn test_range_unsupported() {
        let idx = index();
        let key = IndexKey::single(&Value::Int64(1)).unwrap();
        assert!(matches!(
            idx.find_range(&key, &key),
            Err(DbError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_reset() {
        let idx = index();
        let key = IndexKey::single(&Value::Int64(1)).unwrap();
        idx.insert(&key, &[1, 2]).unwrap();
        idx.reset().unwrap();
        assert!(idx.is_empty());
    }
}
