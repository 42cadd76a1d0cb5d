// Paged rows: the physical row storage of one table version.
//
// A logical, ordered list of rows split into fixed-size pages so the buffer
// pool can spill cold pages. Pages register with the pool on construction
// and unregister on release.

use crate::buffer::{BufferPool, PageId, RowPage};
use crate::common::Row;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct PagedRows {
    pool: Arc<BufferPool>,
    pages: Vec<Arc<RowPage>>,
    /// Absolute row index at which each page starts.
    offsets: Vec<usize>,
    row_count: usize,
    released: AtomicBool,
}

impl PagedRows {
    /// Split a flat row slice into pages. A single empty page exists even
    /// for zero rows.
    pub fn from_rows(
        pool: &Arc<BufferPool>,
        table: &str,
        version: u64,
        rows: Vec<Row>,
    ) -> Arc<Self> {
        let mut builder = PagedRowsBuilder::new(pool, table, version);
        builder.add_page(rows);
        builder.finish()
    }

    pub fn builder(pool: &Arc<BufferPool>, table: &str, version: u64) -> PagedRowsBuilder {
        PagedRowsBuilder::new(pool, table, version)
    }

    pub fn len(&self) -> usize {
        self.row_count
    }

    pub fn is_empty(&self) -> bool {
        self.row_count == 0
    }

    /// Read the row at an absolute index: locate the page by prefix sum,
    /// pin, read, unpin.
    pub fn get(&self, index: usize) -> Result<Option<Row>> {
        if index >= self.row_count {
            return Ok(None);
        }
        let page_idx = match self.offsets.binary_search(&index) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let page = &self.pages[page_idx];
        self.pool.pin(page)?;
        let row = page.row(index - self.offsets[page_idx]);
        self.pool.unpin(page);
        Ok(row)
    }

    /// Materialize all rows into a new owned vector, pinning each page in
    /// turn.
    pub fn to_vec(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(self.row_count);
        for page in &self.pages {
            self.pool.pin(page)?;
            rows.extend(page.rows_cloned());
            self.pool.unpin(page);
        }
        Ok(rows)
    }

    /// Unregister every page from the buffer pool, deleting spill files.
    /// Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for page in &self.pages {
            self.pool.unregister(page);
        }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Builds paged rows incrementally so bulk loads never hold the full dataset
/// as one flat slice.
pub struct PagedRowsBuilder {
    pool: Arc<BufferPool>,
    table: String,
    version: u64,
    pages: Vec<Arc<RowPage>>,
    offsets: Vec<usize>,
    row_count: usize,
}

impl PagedRowsBuilder {
    fn new(pool: &Arc<BufferPool>, table: &str, version: u64) -> Self {
        Self {
            pool: pool.clone(),
            table: table.to_string(),
            version,
            pages: Vec::new(),
            offsets: Vec::new(),
            row_count: 0,
        }
    }

    /// Append rows, splitting into pages of the pool's configured size. The
    /// pool may evict earlier pages while the load is still running.
    pub fn add_page(&mut self, rows: Vec<Row>) {
        if rows.is_empty() {
            return;
        }
        let page_size = self.pool.page_row_count();
        let mut rows = rows;
        loop {
            let chunk: Vec<Row> = if rows.len() > page_size {
                let rest = rows.split_off(page_size);
                std::mem::replace(&mut rows, rest)
            } else {
                std::mem::take(&mut rows)
            };
            self.push_page(chunk);
            if rows.is_empty() {
                break;
            }
        }
    }

    fn push_page(&mut self, rows: Vec<Row>) {
        let index = self.pages.len();
        let page = Arc::new(RowPage::new(
            PageId::new(self.table.clone(), self.version, index),
            rows,
        ));
        self.offsets.push(self.row_count);
        self.row_count += page.row_count();
        self.pool.register(&page);
        self.pages.push(page);
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn finish(mut self) -> Arc<PagedRows> {
        if self.pages.is_empty() {
            self.push_page(Vec::new());
        }
        Arc::new(PagedRows {
            pool: self.pool,
            pages: self.pages,
            offsets: self.offsets,
            row_count: self.row_count,
            released: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, BufferPoolConfig};
    use crate::common::Value;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), Value::Int64(i as i64));
                row
            })
            .collect()
    }

    fn pool_with_page_size(page_rows: usize) -> Arc<BufferPool> {
        BufferPool::new(BufferPoolConfig {
            page_row_count: page_rows,
            ..BufferPoolConfig::default()
        })
    }

    #[test]
    fn test_empty_has_one_page() {
        let pool = pool_with_page_size(4);
        let paged = PagedRows::from_rows(&pool, "t", 1, Vec::new());
        assert_eq!(paged.len(), 0);
        assert_eq!(paged.page_count(), 1);
        assert!(paged.get(0).unwrap().is_none());
        paged.release();
    }

    #[test]
    fn test_get_across_pages() {
        let pool = pool_with_page_size(4);
        let paged = PagedRows::from_rows(&pool, "t", 1, rows(10));
        assert_eq!(paged.page_count(), 3);
        for i in 0..10 {
            let row = paged.get(i).unwrap().unwrap();
            assert_eq!(row["id"], Value::Int64(i as i64));
        }
        assert!(paged.get(10).unwrap().is_none());
        paged.release();
    }

    #[test]
    fn test_materialize_preserves_order() {
        let pool = pool_with_page_size(3);
        let original = rows(8);
        let paged = PagedRows::from_rows(&pool, "t", 1, original.clone());
        assert_eq!(paged.to_vec().unwrap(), original);
        paged.release();
    }

    #[test]
    fn test_builder_incremental() {
        let pool = pool_with_page_size(4);
        let mut builder = PagedRows::builder(&pool, "t", 1);
        builder.add_page(rows(6));
        builder.add_page(rows(3));
        let paged = builder.finish();
        assert_eq!(paged.len(), 9);
        // 6 rows split 4+2, then 3 more in their own page.
        assert_eq!(paged.page_count(), 3);
        paged.release();
    }

    #[test]
    fn test_release_idempotent() {
        let pool = pool_with_page_size(4);
        let paged = PagedRows::from_rows(&pool, "t", 1, rows(5));
        paged.release();
        paged.release();
        assert_eq!(pool.stats().registered_pages, 0);
    }
}
