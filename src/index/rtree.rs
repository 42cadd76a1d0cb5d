// Spatial index: a 2-D R-tree with quadratic split.
//
// Keys carry point or box geometry as flattened numeric parts (2 floats =
// point, 4 floats = min-x, min-y, max-x, max-y). Entries are distributed on
// overflow with Guttman's quadratic split, honoring the minimum fill.

use crate::common::RowId;
use crate::error::DbError;
use crate::index::{Index, IndexInfo, IndexKey};
use crate::Result;
use parking_lot::RwLock;

const DEFAULT_MAX_ENTRIES: usize = 8;

/// 2D bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    pub fn from_point(x: f64, y: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    fn empty() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        }
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Whether `other` lies entirely within this box.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    pub fn area(&self) -> f64 {
        if self.max_x < self.min_x || self.max_y < self.min_y {
            return 0.0;
        }
        (self.max_x - self.min_x) * (self.max_y - self.min_y)
    }

    fn enlargement_needed(&self, other: &BoundingBox) -> f64 {
        self.union(other).area() - self.area()
    }

    /// Parse geometry from a key's numeric parts.
    pub fn from_key(key: &IndexKey) -> Result<Self> {
        let parts = key.as_f64_parts().ok_or_else(|| {
            DbError::UnsupportedKeyType("spatial key requires numeric parts".to_string())
        })?;
        match parts.as_slice() {
            [x, y] => Ok(Self::from_point(*x, *y)),
            [x1, y1, x2, y2] => Ok(Self::new(*x1, *y1, *x2, *y2)),
            _ => Err(DbError::UnsupportedKeyType(format!(
                "spatial key requires 2 or 4 numeric parts, got {}",
                parts.len()
            ))),
        }
    }
}

enum EntryData {
    Item(RowId),
    Child(Box<Node>),
}

struct Entry {
    bbox: BoundingBox,
    data: EntryData,
}

struct Node {
    is_leaf: bool,
    entries: Vec<Entry>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            entries: Vec::new(),
        }
    }

    fn new_internal() -> Self {
        Self {
            is_leaf: false,
            entries: Vec::new(),
        }
    }

    fn mbr(&self) -> BoundingBox {
        self.entries
            .iter()
            .fold(BoundingBox::empty(), |acc, e| acc.union(&e.bbox))
    }
}

pub struct RTreeIndex {
    info: IndexInfo,
    max_entries: usize,
    min_entries: usize,
    root: RwLock<Node>,
}

impl RTreeIndex {
    pub fn new(info: IndexInfo) -> Self {
        Self::with_capacity(info, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(info: IndexInfo, max_entries: usize) -> Self {
        assert!(max_entries >= 4, "R-tree node capacity must be at least 4");
        Self {
            info,
            max_entries,
            min_entries: max_entries / 2,
            root: RwLock::new(Node::new_leaf()),
        }
    }

    /// Entries intersecting the query box.
    pub fn search_intersects(&self, query: &BoundingBox) -> Vec<RowId> {
        let root = self.root.read();
        let mut results = Vec::new();
        Self::collect(&root, query, false, &mut results);
        results.sort_unstable();
        results.dedup();
        results
    }

    /// Entries fully contained within the query box.
    pub fn search_contains(&self, query: &BoundingBox) -> Vec<RowId> {
        let root = self.root.read();
        let mut results = Vec::new();
        Self::collect(&root, query, true, &mut results);
        results.sort_unstable();
        results.dedup();
        results
    }

    fn collect(node: &Node, query: &BoundingBox, contained: bool, out: &mut Vec<RowId>) {
        for entry in &node.entries {
            if !entry.bbox.intersects(query) {
                continue;
            }
            match &entry.data {
                EntryData::Item(row_id) => {
                    if !contained || query.contains(&entry.bbox) {
                        out.push(*row_id);
                    }
                }
                EntryData::Child(child) => Self::collect(child, query, contained, out),
            }
        }
    }

    fn insert_entry(&self, bbox: BoundingBox, row_id: RowId) {
        let mut root = self.root.write();
        if let Some(sibling) = self.insert_rec(&mut root, bbox, row_id) {
            // Root overflowed: grow the tree by one level.
            let old_root = std::mem::replace(&mut *root, Node::new_internal());
            let old_mbr = old_root.mbr();
            let sibling_mbr = sibling.mbr();
            root.entries.push(Entry {
                bbox: old_mbr,
                data: EntryData::Child(Box::new(old_root)),
            });
            root.entries.push(Entry {
                bbox: sibling_mbr,
                data: EntryData::Child(Box::new(sibling)),
            });
        }
    }

    fn insert_rec(&self, node: &mut Node, bbox: BoundingBox, row_id: RowId) -> Option<Node> {
        if node.is_leaf {
            node.entries.push(Entry {
                bbox,
                data: EntryData::Item(row_id),
            });
            if node.entries.len() > self.max_entries {
                return Some(self.split(node));
            }
            return None;
        }

        // Descend into the child needing least enlargement.
        let mut best = 0usize;
        let mut best_enlargement = f64::INFINITY;
        for (i, entry) in node.entries.iter().enumerate() {
            let enlargement = entry.bbox.enlargement_needed(&bbox);
            if enlargement < best_enlargement {
                best = i;
                best_enlargement = enlargement;
            }
        }

        let split = match &mut node.entries[best].data {
            EntryData::Child(child) => {
                let split = self.insert_rec(child, bbox, row_id);
                let updated_mbr = child.mbr();
                (split, Some(updated_mbr))
            }
            EntryData::Item(_) => (None, None),
        };
        if let Some(updated_mbr) = split.1 {
            node.entries[best].bbox = updated_mbr;
        }

        if let Some(sibling) = split.0 {
            let sibling_mbr = sibling.mbr();
            node.entries.push(Entry {
                bbox: sibling_mbr,
                data: EntryData::Child(Box::new(sibling)),
            });
            if node.entries.len() > self.max_entries {
                return Some(self.split(node));
            }
        }
        None
    }

    /// Guttman's quadratic split: seed with the pair wasting the most area,
    /// then assign each remaining entry to the group needing least
    /// enlargement, forcing assignment once a group must absorb the rest to
    /// reach the minimum fill.
    fn split(&self, node: &mut Node) -> Node {
        let mut entries: Vec<Entry> = std::mem::take(&mut node.entries);

        let (seed1, seed2) = Self::pick_seeds(&entries);
        let second = entries.remove(seed1.max(seed2));
        let first = entries.remove(seed1.min(seed2));

        let mut group1 = vec![first];
        let mut group2 = vec![second];
        let mut mbr1 = group1[0].bbox;
        let mut mbr2 = group2[0].bbox;

        while let Some(entry) = entries.pop() {
            let remaining = entries.len() + 1;
            if group1.len() + remaining <= self.min_entries {
                mbr1 = mbr1.union(&entry.bbox);
                group1.push(entry);
                continue;
            }
            if group2.len() + remaining <= self.min_entries {
                mbr2 = mbr2.union(&entry.bbox);
                group2.push(entry);
                continue;
            }
            if mbr1.enlargement_needed(&entry.bbox) <= mbr2.enlargement_needed(&entry.bbox) {
                mbr1 = mbr1.union(&entry.bbox);
                group1.push(entry);
            } else {
                mbr2 = mbr2.union(&entry.bbox);
                group2.push(entry);
            }
        }

        node.entries = group1;
        Node {
            is_leaf: node.is_leaf,
            entries: group2,
        }
    }

    fn pick_seeds(entries: &[Entry]) -> (usize, usize) {
        let mut max_waste = f64::NEG_INFINITY;
        let mut seeds = (0, 1);
        for i in 0..entries.len() {
            for j in (i + 1)..entries.len() {
                let combined = entries[i].bbox.union(&entries[j].bbox);
                let waste = combined.area() - entries[i].bbox.area() - entries[j].bbox.area();
                if waste > max_waste {
                    max_waste = waste;
                    seeds = (i, j);
                }
            }
        }
        seeds
    }

    /// Remove every item with exactly this bounding box. The tree is not
    /// condensed; underfull nodes are tolerated until the next rebuild.
    fn remove_bbox(node: &mut Node, bbox: &BoundingBox) {
        if node.is_leaf {
            node.entries
                .retain(|e| !matches!(e.data, EntryData::Item(_)) || e.bbox != *bbox);
            return;
        }
        for entry in &mut node.entries {
            if let EntryData::Child(child) = &mut entry.data {
                if entry.bbox.intersects(bbox) {
                    Self::remove_bbox(child, bbox);
                    entry.bbox = child.mbr();
                }
            }
        }
        node.entries.retain(|e| match &e.data {
            EntryData::Child(child) => !child.entries.is_empty(),
            EntryData::Item(_) => true,
        });
    }
}

impl Index for RTreeIndex {
    fn info(&self) -> &IndexInfo {
        &self.info
    }

    fn insert(&self, key: &IndexKey, row_ids: &[RowId]) -> Result<()> {
        let bbox = BoundingBox::from_key(key)?;
        for &row_id in row_ids {
            self.insert_entry(bbox, row_id);
        }
        Ok(())
    }

    fn delete(&self, key: &IndexKey) -> Result<()> {
        let bbox = BoundingBox::from_key(key)?;
        let mut root = self.root.write();
        Self::remove_bbox(&mut root, &bbox);
        Ok(())
    }

    fn find(&self, key: &IndexKey) -> Result<Vec<RowId>> {
        let bbox = BoundingBox::from_key(key)?;
        let root = self.root.read();
        // Exact geometry match only.
        let mut results = Vec::new();
        Self::collect_exact(&root, &bbox, &mut results);
        results.sort_unstable();
        results.dedup();
        Ok(results)
    }

    /// Range probe: everything intersecting the box spanned by both keys.
    fn find_range(&self, min: &IndexKey, max: &IndexKey) -> Result<Vec<RowId>> {
        let query = BoundingBox::from_key(min)?.union(&BoundingBox::from_key(max)?);
        Ok(self.search_intersects(&query))
    }

    fn reset(&self) -> Result<()> {
        *self.root.write() = Node::new_leaf();
        Ok(())
    }
}

impl RTreeIndex {
    fn collect_exact(node: &Node, bbox: &BoundingBox, out: &mut Vec<RowId>) {
        for entry in &node.entries {
            match &entry.data {
                EntryData::Item(row_id) => {
                    if entry.bbox == *bbox {
                        out.push(*row_id);
                    }
                }
                EntryData::Child(child) => {
                    if entry.bbox.intersects(bbox) {
                        Self::collect_exact(child, bbox, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use crate::index::IndexKind;

    fn index() -> RTreeIndex {
        RTreeIndex::with_capacity(
            IndexInfo {
                name: "sp_location".to_string(),
                table: "places".to_string(),
                columns: vec!["location".to_string()],
                kind: IndexKind::SpatialRTree,
                unique: false,
            },
            4,
        )
    }

    fn point_key(x: f64, y: f64) -> IndexKey {
        IndexKey::from_values(&[Value::Array(vec![Value::Float64(x), Value::Float64(y)])]).unwrap()
    }

    #[test]
    fn test_intersects_and_contains() {
        let idx = index();
        for i in 0..20 {
            let x = (i % 5) as f64;
            let y = (i / 5) as f64;
            idx.insert(&point_key(x, y), &[i as RowId + 1]).unwrap();
        }

        let query = BoundingBox::new(0.5, 0.5, 2.5, 2.5);
        let hits = idx.search_intersects(&query);
        // Points (1,1), (2,1), (1,2), (2,2)
        assert_eq!(hits.len(), 4);
        assert_eq!(idx.search_contains(&query), hits);
    }

    #[test]
    fn test_exact_find() {
        let idx = index();
        idx.insert(&point_key(1.0, 1.0), &[1]).unwrap();
        idx.insert(&point_key(1.0, 2.0), &[2]).unwrap();
        assert_eq!(idx.find(&point_key(1.0, 1.0)).unwrap(), vec![1]);
        assert!(idx.find(&point_key(9.0, 9.0)).unwrap().is_empty());
    }

    #[test]
    fn test_delete() {
        let idx = index();
        for i in 0..10 {
            idx.insert(&point_key(i as f64, 0.0), &[i as RowId + 1])
                .unwrap();
        }
        idx.delete(&point_key(3.0, 0.0)).unwrap();
        assert!(idx.find(&point_key(3.0, 0.0)).unwrap().is_empty());
        assert_eq!(idx.find(&point_key(4.0, 0.0)).unwrap(), vec![5]);
    }

    #[test]
    fn test_split_preserves_entries() {
        let idx = index();
        // Enough inserts to force several splits with capacity 4.
        for i in 0..100 {
            let x = (i % 10) as f64;
            let y = (i / 10) as f64;
            idx.insert(&point_key(x, y), &[i as RowId + 1]).unwrap();
        }
        let all = idx.search_intersects(&BoundingBox::new(-1.0, -1.0, 11.0, 11.0));
        assert_eq!(all.len(), 100);
    }

    #[test]
    fn test_box_keys() {
        let idx = index();
        let box_key = IndexKey::from_values(&[Value::Array(vec![
            Value::Float64(0.0),
            Value::Float64(0.0),
            Value::Float64(2.0),
            Value::Float64(2.0),
        ])])
        .unwrap();
        idx.insert(&box_key, &[1]).unwrap();

        assert_eq!(
            idx.search_intersects(&BoundingBox::new(1.0, 1.0, 3.0, 3.0)),
            vec![1]
        );
        assert!(idx
            .search_contains(&BoundingBox::new(1.0, 1.0, 3.0, 3.0))
            .is_empty());
    }
}
