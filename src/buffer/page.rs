// A row page: a fixed-size group of rows that can be spilled to disk.
//
// `pin_count` is atomic; `state`, `rows`, and the spill path live behind a
// per-page mutex so a Pin can never observe a page mid-eviction.

use crate::codec;
use crate::common::{row_size_bytes, Row};
use crate::error::DbError;
use crate::Result;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

/// Unique identity of a page: table, table version, page index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageId {
    pub table: String,
    pub version: u64,
    pub index: usize,
}

impl PageId {
    pub fn new(table: impl Into<String>, version: u64, index: usize) -> Self {
        Self {
            table: table.into(),
            version,
            index,
        }
    }

    /// Spill file name; table characters outside [A-Za-z0-9_] are mapped to
    /// '_' so the name is always filesystem-safe.
    pub fn spill_file_name(&self) -> String {
        let safe: String = self
            .table
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("{}-v{}-p{}.page", safe, self.version, self.index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Resident,
    Evicted,
}

struct PageBody {
    state: PageState,
    /// Empty while evicted.
    rows: Vec<Row>,
    /// Set once the page has spilled at least once; the file is reused
    /// across evict/reload cycles and deleted only on release.
    spill_path: Option<PathBuf>,
}

pub struct RowPage {
    id: PageId,
    row_count: usize,
    size_bytes: usize,
    pin_count: AtomicU32,
    body: Mutex<PageBody>,
}

impl RowPage {
    pub fn new(id: PageId, rows: Vec<Row>) -> Self {
        let size_bytes = 64 + rows.iter().map(row_size_bytes).sum::<usize>();
        Self {
            id,
            row_count: rows.len(),
            size_bytes,
            pin_count: AtomicU32::new(0),
            body: Mutex::new(PageBody {
                state: PageState::Resident,
                rows,
                spill_path: None,
            }),
        }
    }

    pub fn id(&self) -> &PageId {
        &self.id
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PageState {
        self.body.lock().state
    }

    /// Ensure the page is resident and take a pin. Returns true when the
    /// page had to be reloaded from its spill file.
    pub(crate) fn pin(&self) -> Result<bool> {
        let mut body = self.body.lock();
        let reloaded = if body.state == PageState::Evicted {
            self.reload(&mut body)?;
            true
        } else {
            false
        };
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        Ok(reloaded)
    }

    /// Drop a pin; saturates at zero.
    pub(crate) fn unpin(&self) {
        let _ = self
            .pin_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1));
    }

    /// Spill the page. Skipped (returns false) while pinned or already
    /// evicted; the pin check happens under the body lock, which is the same
    /// lock `pin` holds while reloading, so the two can never interleave.
    pub(crate) fn evict(&self, spill_dir: &Path) -> Result<bool> {
        let mut body = self.body.lock();
        if body.state == PageState::Evicted || self.pin_count.load(Ordering::Acquire) > 0 {
            return Ok(false);
        }

        let encoded = codec::encode_rows(&body.rows);
        fs::create_dir_all(spill_dir)?;
        let path = match &body.spill_path {
            Some(existing) => existing.clone(),
            None => spill_dir.join(self.id.spill_file_name()),
        };
        fs::write(&path, &encoded)?;

        body.spill_path = Some(path);
        body.rows = Vec::new();
        body.state = PageState::Evicted;
        Ok(true)
    }

    fn reload(&self, body: &mut PageBody) -> Result<()> {
        let path = body
            .spill_path
            .as_ref()
            .ok_or_else(|| DbError::Internal(format!("page {:?} evicted without spill file", self.id)))?;
        let data = fs::read(path)?;
        let rows = codec::decode_rows(&data)?;
        if rows.len() != self.row_count {
            return Err(DbError::PageDecode(format!(
                "spill file for {:?} holds {} rows, expected {}",
                self.id,
                rows.len(),
                self.row_count
            )));
        }
        body.rows = rows;
        body.state = PageState::Resident;
        Ok(())
    }

    /// Read one row by index within the page. Caller must hold a pin.
    pub(crate) fn row(&self, idx: usize) -> Option<Row> {
        let body = self.body.lock();
        body.rows.get(idx).cloned()
    }

    /// Clone out all rows. Caller must hold a pin.
    pub(crate) fn rows_cloned(&self) -> Vec<Row> {
        self.body.lock().rows.clone()
    }

    /// Delete the spill file, if any. Runs when the last reference to the
    /// page drops, or eagerly from `BufferPool::close`.
    pub(crate) fn remove_spill_file(&self) {
        let mut body = self.body.lock();
        if let Some(path) = body.spill_path.take() {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove spill file");
                }
            }
        }
    }
}

impl Drop for RowPage {
    fn drop(&mut self) {
        // Readers of a garbage-collected version keep the page alive through
        // their Arc; the spill file must outlive every such reader.
        self.remove_spill_file();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;

    fn sample_rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), Value::Int64(i as i64));
                row.insert("name".to_string(), Value::String(format!("row-{}", i)));
                row
            })
            .collect()
    }

    #[test]
    fn test_evict_reload_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let page = RowPage::new(PageId::new("t", 1, 0), sample_rows(5));

        assert!(page.evict(dir.path()).unwrap());
        assert_eq!(page.state(), PageState::Evicted);

        assert!(page.pin().unwrap());
        assert_eq!(page.state(), PageState::Resident);
        assert_eq!(page.row(2).unwrap()["id"], Value::Int64(2));
        page.unpin();

        // Second eviction reuses the same file.
        assert!(page.evict(dir.path()).unwrap());
        assert!(page.pin().unwrap());
        page.unpin();
    }

    #[test]
    fn test_evict_refused_while_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let page = RowPage::new(PageId::new("t", 1, 0), sample_rows(3));

        page.pin().unwrap();
        assert!(!page.evict(dir.path()).unwrap());
        page.unpin();
        assert!(page.evict(dir.path()).unwrap());
    }

    #[test]
    fn test_unpin_saturates() {
        let page = RowPage::new(PageId::new("t", 1, 0), sample_rows(1));
        page.unpin();
        assert_eq!(page.pin_count(), 0);
        page.pin().unwrap();
        page.unpin();
        page.unpin();
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn test_spill_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let page = RowPage::new(PageId::new("t", 1, 0), sample_rows(2));
        page.evict(dir.path()).unwrap();

        let file = dir.path().join(page.id().spill_file_name());
        assert!(file.exists());
        page.remove_spill_file();
        assert!(!file.exists());
    }
}
