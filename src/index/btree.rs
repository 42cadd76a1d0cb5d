// Ordered index: a B+ tree mapping keys to row-id posting lists.
//
// Leaf nodes are chained for range scans. Writers descend with latch
// crabbing: the parent latch is dropped before recursing into a child and
// re-taken only when the child split.

use crate::common::RowId;
use crate::error::DbError;
use crate::index::{Index, IndexInfo, IndexKey};
use crate::Result;
use parking_lot::RwLock;
use std::sync::Arc;

/// Max keys per node before it splits.
const DEFAULT_ORDER: usize = 64;

pub struct BTreeIndex {
    info: IndexInfo,
    order: usize,
    root: RwLock<Option<NodeRef>>,
}

type NodeRef = Arc<RwLock<Node>>;

struct Node {
    is_leaf: bool,
    keys: Vec<IndexKey>,
    /// Leaf nodes: posting list per key, parallel to `keys`.
    postings: Vec<Vec<RowId>>,
    /// Internal nodes: child pointers.
    children: Vec<NodeRef>,
    /// Leaf nodes: next leaf in key order.
    next_leaf: Option<NodeRef>,
}

impl Node {
    fn new_leaf(order: usize) -> Self {
        Self {
            is_leaf: true,
            keys: Vec::with_capacity(order),
            postings: Vec::with_capacity(order),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    fn new_internal(order: usize) -> Self {
        Self {
            is_leaf: false,
            keys: Vec::with_capacity(order),
            postings: Vec::new(),
            children: Vec::with_capacity(order + 1),
            next_leaf: None,
        }
    }

    fn find_child_index(&self, key: &IndexKey) -> usize {
        for (i, k) in self.keys.iter().enumerate() {
            if key < k {
                return i;
            }
        }
        self.keys.len()
    }

    fn insert_in_leaf(&mut self, key: &IndexKey, row_ids: &[RowId]) {
        match self.keys.binary_search(key) {
            Ok(pos) => self.postings[pos].extend_from_slice(row_ids),
            Err(pos) => {
                self.keys.insert(pos, key.clone());
                self.postings.insert(pos, row_ids.to_vec());
            }
        }
    }

    fn split_leaf(&mut self, order: usize) -> (IndexKey, Node) {
        let split_point = order / 2;
        let mut new_leaf = Node::new_leaf(order);
        new_leaf.keys = self.keys.split_off(split_point);
        new_leaf.postings = self.postings.split_off(split_point);
        new_leaf.next_leaf = self.next_leaf.take();
        let split_key = new_leaf.keys[0].clone();
        (split_key, new_leaf)
    }

    fn split_internal(&mut self, order: usize) -> (IndexKey, Node) {
        let split_point = order / 2;
        let mut new_node = Node::new_internal(order);
        new_node.children = self.children.split_off(split_point + 1);
        let median_key = self.keys.remove(split_point);
        new_node.keys = self.keys.split_off(split_point);
        (median_key, new_node)
    }
}

impl BTreeIndex {
    pub fn new(info: IndexInfo) -> Self {
        Self::with_order(info, DEFAULT_ORDER)
    }

    pub fn with_order(info: IndexInfo, order: usize) -> Self {
        assert!(order >= 3, "B+ tree order must be at least 3");
        Self {
            info,
            order,
            root: RwLock::new(None),
        }
    }

    fn insert_recursive(
        &self,
        node_ref: NodeRef,
        key: &IndexKey,
        row_ids: &[RowId],
    ) -> Option<(IndexKey, NodeRef)> {
        let mut node = node_ref.write();

        if node.is_leaf {
            node.insert_in_leaf(key, row_ids);
            if node.keys.len() >= self.order {
                let (split_key, new_node) = node.split_leaf(self.order);
                let new_ref = Arc::new(RwLock::new(new_node));
                node.next_leaf = Some(new_ref.clone());
                Some((split_key, new_ref))
            } else {
                None
            }
        } else {
            let child_idx = node.find_child_index(key);
            let child = node.children[child_idx].clone();
            drop(node);

            let split = self.insert_recursive(child, key, row_ids)?;
            let (split_key, new_child) = split;

            let mut node = node_ref.write();
            node.keys.insert(child_idx, split_key);
            node.children.insert(child_idx + 1, new_child);

            if node.keys.len() >= self.order {
                let (median_key, new_node) = node.split_internal(self.order);
                Some((median_key, Arc::new(RwLock::new(new_node))))
            } else {
                None
            }
        }
    }

    fn find_leaf(&self, node_ref: NodeRef, key: &IndexKey) -> NodeRef {
        let node = node_ref.read();
        if node.is_leaf {
            drop(node);
            node_ref
        } else {
            let child = node.children[node.find_child_index(key)].clone();
            drop(node);
            self.find_leaf(child, key)
        }
    }
}

impl Index for BTreeIndex {
    fn info(&self) -> &IndexInfo {
        &self.info
    }

    fn insert(&self, key: &IndexKey, row_ids: &[RowId]) -> Result<()> {
        let mut root_lock = self.root.write();

        if root_lock.is_none() {
            let mut leaf = Node::new_leaf(self.order);
            leaf.insert_in_leaf(key, row_ids);
            *root_lock = Some(Arc::new(RwLock::new(leaf)));
            return Ok(());
        }

        let root = root_lock.as_ref().map(Arc::clone).ok_or_else(|| {
            DbError::Internal("btree root vanished under write lock".into())
        })?;
        drop(root_lock);

        if let Some((split_key, new_node)) = self.insert_recursive(root, key, row_ids) {
            let mut root_lock = self.root.write();
            let old_root = root_lock.as_ref().map(Arc::clone).ok_or_else(|| {
                DbError::Internal("btree root vanished during split".into())
            })?;

            let mut new_root = Node::new_internal(self.order);
            new_root.children.push(old_root);
            new_root.keys.push(split_key);
            new_root.children.push(new_node);
            *root_lock = Some(Arc::new(RwLock::new(new_root)));
        }
        Ok(())
    }

    fn delete(&self, key: &IndexKey) -> Result<()> {
        let root = match self.root.read().as_ref() {
            None => return Ok(()),
            Some(root) => root.clone(),
        };
        let leaf = self.find_leaf(root, key);
        let mut node = leaf.write();
        if let Ok(pos) = node.keys.binary_search(key) {
            node.keys.remove(pos);
            node.postings.remove(pos);
        }
        Ok(())
    }

    fn find(&self, key: &IndexKey) -> Result<Vec<RowId>> {
        let root = match self.root.read().as_ref() {
            None => return Ok(Vec::new()),
            Some(root) => root.clone(),
        };
        let leaf = self.find_leaf(root, key);
        let node = leaf.read();
        Ok(match node.keys.binary_search(key) {
            Ok(pos) => node.postings[pos].clone(),
            Err(_) => Vec::new(),
        })
    }

    fn find_range(&self, min: &IndexKey, max: &IndexKey) -> Result<Vec<RowId>> {
        let root = match self.root.read().as_ref() {
            None => return Ok(Vec::new()),
            Some(root) => root.clone(),
        };
        let mut current = self.find_leaf(root, min);
        let mut results = Vec::new();

        loop {
            let leaf = current.read();
            for (i, k) in leaf.keys.iter().enumerate() {
                if k > max {
                    return Ok(results);
                }
                if k >= min {
                    results.extend_from_slice(&leaf.postings[i]);
                }
            }
            match &leaf.next_leaf {
                Some(next) => {
                    let next = next.clone();
                    drop(leaf);
                    current = next;
                }
                None => break,
            }
        }
        Ok(results)
    }

    fn reset(&self) -> Result<()> {
        *self.root.write() = None;
        Ok(())
    }
}
