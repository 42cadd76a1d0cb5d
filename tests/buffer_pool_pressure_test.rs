// Buffer pool under memory pressure: concurrent pin/unpin readers against
// eviction threads, spill and reload through the page codec.

use snapdb::buffer::{BufferPool, BufferPoolConfig};
use snapdb::storage::PagedRows;
use snapdb::{
    ColumnInfo, DataType, Engine, EngineConfig, OperationContext, QueryOptions, Row, TableInfo,
    Value,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn wide_row(id: i64) -> Row {
    let mut row = Row::new();
    row.insert("id".to_string(), Value::Int64(id));
    row.insert("payload".to_string(), Value::String("p".repeat(512)));
    row
}

#[test]
fn test_concurrent_pin_unpin_with_evictors() {
    let dir = tempfile::tempdir().unwrap();
    // Budget far below the ~110KB dataset so the evictors always have work.
    let pool = BufferPool::new(BufferPoolConfig {
        enabled: true,
        max_memory_bytes: 16 * 1024,
        page_row_count: 10,
        spill_dir: dir.path().to_path_buf(),
        evict_interval_ms: 1,
    });

    // 20 pages x 10 rows.
    let rows: Vec<Row> = (0..200).map(|i| wide_row(i)).collect();
    let paged = PagedRows::from_rows(&pool, "pressure", 1, rows);
    assert_eq!(paged.page_count(), 20);

    // Keep memory above budget so the evictors always have work.
    pool.try_evict();

    let stop = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    for _ in 0..2 {
        let pool = pool.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                pool.try_evict();
                thread::sleep(Duration::from_millis(1));
            }
        }));
    }

    let mut readers = Vec::new();
    for t in 0..8usize {
        let paged = paged.clone();
        readers.push(thread::spawn(move || {
            for i in 0..200usize {
                let index = (t * 37 + i * 13) % 200;
                let row = paged
                    .get(index)
                    .expect("read through pin must succeed")
                    .expect("row must exist");
                assert_eq!(row["id"], Value::Int64(index as i64));
            }
        }));
    }
    for reader in readers {
        reader.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert!(stats.evictions > 0, "expected spills, got {:?}", stats);
    assert!(stats.reloads > 0, "expected reloads, got {:?}", stats);

    // Every row is still intact after the churn.
    let all = paged.to_vec().unwrap();
    assert_eq!(all.len(), 200);
    for (i, row) in all.iter().enumerate() {
        assert_eq!(row["id"], Value::Int64(i as i64));
    }

    paged.release();
    drop(paged);
    pool.close();
    assert!(std::fs::read_dir(dir.path())
        .map(|entries| entries.count() == 0)
        .unwrap_or(true));
}

#[test]
fn test_engine_reads_through_spilled_pages() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::new(EngineConfig {
        read_only: false,
        buffer_pool: BufferPoolConfig {
            enabled: true,
            max_memory_bytes: 16 * 1024,
            page_row_count: 10,
            spill_dir: dir.path().to_path_buf(),
            evict_interval_ms: 0,
        },
    });
    let ctx = OperationContext::new();
    engine.connect(&ctx).unwrap();
    engine
        .create_table(
            &ctx,
            TableInfo::new(
                "big",
                vec![
                    ColumnInfo::new("id", DataType::Int64),
                    ColumnInfo::new("payload", DataType::String),
                ],
            ),
        )
        .unwrap();

    let rows: Vec<Row> = (0..300).map(wide_row).collect();
    engine.insert(&ctx, "big", rows).unwrap();

    let stats = engine.buffer_pool_stats();
    assert!(
        stats.evicted_pages > 0,
        "pool should have spilled under a 16KB budget: {:?}",
        stats
    );

    // A full scan transparently reloads evicted pages.
    let result = engine.query(&ctx, "big", &QueryOptions::new()).unwrap();
    assert_eq!(result.total, 300);

    engine.close(&ctx).unwrap();
}
