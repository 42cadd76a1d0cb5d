// Buffer pool: memory accounting, pin/unpin, and eviction for row pages.
//
// Every page of every table version registers here. When resident memory
// exceeds the budget, unpinned pages are spilled through the page codec,
// preferring pages of non-latest versions. A disabled pool (the default)
// registers pages and never spills.

use crate::buffer::page::{PageId, PageState, RowPage};
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Buffer pool configuration
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// When false the pool is a passthrough: pages stay resident forever.
    pub enabled: bool,

    /// Resident-memory budget in bytes.
    pub max_memory_bytes: usize,

    /// Rows per page when paged rows are built.
    pub page_row_count: usize,

    /// Directory for spill files. Created lazily on first eviction. Files
    /// are removed when their page is released and best-effort swept on
    /// `close`; orphans from an aborted process stay here, so point this at
    /// a disposable directory.
    pub spill_dir: PathBuf,

    /// Background eviction interval. Zero disables the background thread;
    /// eviction then only runs when `try_evict` is called.
    pub evict_interval_ms: u64,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_memory_bytes: 64 * 1024 * 1024,
            page_row_count: 256,
            spill_dir: std::env::temp_dir().join("snapdb-spill"),
            evict_interval_ms: 100,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default)]
pub struct BufferPoolStats {
    pub used_memory_bytes: usize,
    pub registered_pages: usize,
    pub resident_pages: usize,
    pub evicted_pages: usize,
    pub evictions: u64,
    pub reloads: u64,
}

pub struct BufferPool {
    config: BufferPoolConfig,
    used_memory: AtomicUsize,
    pages: DashMap<PageId, Arc<RowPage>>,
    /// Per-table protected version: pages of this version are evicted last.
    latest_versions: DashMap<String, u64>,
    evictions: AtomicU64,
    reloads: AtomicU64,
    stopped: AtomicBool,
    evictor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BufferPool {
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        let pool = Arc::new(Self {
            config,
            used_memory: AtomicUsize::new(0),
            pages: DashMap::new(),
            latest_versions: DashMap::new(),
            evictions: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            evictor: Mutex::new(None),
        });
        if pool.config.enabled && pool.config.evict_interval_ms > 0 {
            pool.start_evictor();
        }
        pool
    }

    /// Passthrough pool with default configuration.
    pub fn disabled() -> Arc<Self> {
        Self::new(BufferPoolConfig::default())
    }

    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    pub fn page_row_count(&self) -> usize {
        self.config.page_row_count.max(1)
    }

    fn start_evictor(self: &Arc<Self>) {
        let weak: Weak<BufferPool> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.evict_interval_ms);
        let handle = thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(pool) = weak.upgrade() else { break };
            if pool.stopped.load(Ordering::Acquire) {
                break;
            }
            pool.try_evict();
        });
        *self.evictor.lock() = Some(handle);
    }

    /// Add a page to the pool and credit its size.
    pub fn register(&self, page: &Arc<RowPage>) {
        self.pages.insert(page.id().clone(), page.clone());
        self.used_memory
            .fetch_add(page.size_bytes(), Ordering::AcqRel);
        if self.config.enabled {
            self.try_evict();
        }
    }

    /// Remove a page from the pool and return its memory. The spill file
    /// lives until the last reference to the page drops, so in-flight
    /// readers of a released version can still reload it.
    pub fn unregister(&self, page: &Arc<RowPage>) {
        if self.pages.remove(page.id()).is_some() && page.state() == PageState::Resident {
            self.release_memory(page.size_bytes());
        }
    }

    /// Ensure the page is resident and take a pin. The caller must `unpin`
    /// exactly once.
    pub fn pin(&self, page: &RowPage) -> Result<()> {
        let reloaded = page.pin()?;
        if reloaded {
            self.used_memory
                .fetch_add(page.size_bytes(), Ordering::AcqRel);
            self.reloads.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    pub fn unpin(&self, page: &RowPage) {
        page.unpin();
    }

    fn release_memory(&self, bytes: usize) {
        let _ = self
            .used_memory
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                Some(used.saturating_sub(bytes))
            });
    }

    /// Mark `version` as the protected (current) version of a table.
    pub fn update_latest_version(&self, table: &str, version: u64) {
        self.latest_versions.insert(table.to_string(), version);
    }

    /// Evict unpinned pages until memory is within budget or no candidate
    /// remains. Pages of non-latest versions go first, oldest version first.
    pub fn try_evict(&self) {
        if !self.config.enabled {
            return;
        }
        if self.used_memory.load(Ordering::Acquire) <= self.config.max_memory_bytes {
            return;
        }

        let mut candidates: Vec<Arc<RowPage>> = self
            .pages
            .iter()
            .filter(|entry| {
                entry.value().pin_count() == 0 && entry.value().state() == PageState::Resident
            })
            .map(|entry| entry.value().clone())
            .collect();

        candidates.sort_by_key(|page| {
            let id = page.id();
            let is_latest = self
                .latest_versions
                .get(&id.table)
                .map(|v| *v == id.version)
                .unwrap_or(false);
            (is_latest, id.version, id.index)
        });

        for page in candidates {
            if self.used_memory.load(Ordering::Acquire) <= self.config.max_memory_bytes {
                break;
            }
            match page.evict(&self.config.spill_dir) {
                Ok(true) => {
                    self.release_memory(page.size_bytes());
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(page = ?page.id(), "evicted page to spill");
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(page = ?page.id(), error = %e, "page eviction failed");
                }
            }
        }
    }

    pub fn stats(&self) -> BufferPoolStats {
        let mut resident = 0usize;
        let mut evicted = 0usize;
        for entry in self.pages.iter() {
            match entry.value().state() {
                PageState::Resident => resident += 1,
                PageState::Evicted => evicted += 1,
            }
        }
        BufferPoolStats {
            used_memory_bytes: self.used_memory.load(Ordering::Acquire),
            registered_pages: self.pages.len(),
            resident_pages: resident,
            evicted_pages: evicted,
            evictions: self.evictions.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
        }
    }

    /// Stop the background evictor and delete all spill files this pool
    /// created. Registered pages stay usable in memory.
    pub fn close(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Some(handle) = self.evictor.lock().take() {
            let _ = handle.join();
        }
        for entry in self.pages.iter() {
            let page = entry.value();
            if page.state() == PageState::Evicted {
                // Bring the rows back before the file disappears.
                if page.pin().is_ok() {
                    self.used_memory
                        .fetch_add(page.size_bytes(), Ordering::AcqRel);
                    page.unpin();
                }
            }
            page.remove_spill_file();
        }
        let _ = std::fs::remove_dir(&self.config.spill_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Row, Value};

    fn page_with_rows(table: &str, version: u64, index: usize, n: usize) -> Arc<RowPage> {
        let rows: Vec<Row> = (0..n)
            .map(|i| {
                let mut row = Row::new();
                row.insert("id".to_string(), Value::Int64(i as i64));
                row.insert(
                    "payload".to_string(),
                    Value::String("x".repeat(64)),
                );
                row
            })
            .collect();
        Arc::new(RowPage::new(PageId::new(table, version, index), rows))
    }

    fn small_pool(dir: &std::path::Path, max_bytes: usize) -> Arc<BufferPool> {
        BufferPool::new(BufferPoolConfig {
            enabled: true,
            max_memory_bytes: max_bytes,
            page_row_count: 10,
            spill_dir: dir.to_path_buf(),
            evict_interval_ms: 0,
        })
    }

    #[test]
    fn test_passthrough_never_spills() {
        let pool = BufferPool::disabled();
        let page = page_with_rows("t", 1, 0, 100);
        pool.register(&page);
        pool.try_evict();
        assert_eq!(page.state(), PageState::Resident);
        assert_eq!(pool.stats().evictions, 0);
        pool.unregister(&page);
    }

    #[test]
    fn test_eviction_under_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 1024);

        let pages: Vec<_> = (0..8).map(|i| page_with_rows("t", 1, i, 10)).collect();
        for page in &pages {
            pool.register(page);
        }
        pool.try_evict();

        let stats = pool.stats();
        assert!(stats.evicted_pages > 0, "expected spills, got {:?}", stats);

        // Pinning an evicted page reloads it transparently.
        let evicted = pages
            .iter()
            .find(|p| p.state() == PageState::Evicted)
            .unwrap();
        pool.pin(evicted).unwrap();
        assert_eq!(evicted.state(), PageState::Resident);
        assert_eq!(evicted.row(0).unwrap()["id"], Value::Int64(0));
        pool.unpin(evicted);

        pool.close();
    }

    #[test]
    fn test_latest_version_preferred_last() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 0);

        let old = page_with_rows("t", 1, 0, 10);
        let new = page_with_rows("t", 2, 0, 10);
        pool.register(&old);
        pool.register(&new);
        pool.update_latest_version("t", 2);

        // Budget zero: everything unpinned gets evicted, old version first.
        pool.try_evict();
        assert_eq!(old.state(), PageState::Evicted);

        pool.close();
    }

    #[test]
    fn test_close_removes_spill_files() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), 0);
        let page = page_with_rows("t", 1, 0, 10);
        pool.register(&page);
        pool.try_evict();
        assert_eq!(page.state(), PageState::Evicted);

        pool.close();
        let spill = dir.path().join(page.id().spill_file_name());
        assert!(!spill.exists());
        // Rows survived the close.
        assert_eq!(page.state(), PageState::Resident);
    }
}
