// The engine facade.
//
// Owns the table registry, the global version counter, transactions and
// snapshots, auto-increment counters, the buffer pool, and the index
// manager. All public operations are synchronous; transaction binding and
// cancellation travel in an explicit `OperationContext`.
//
// Lock hierarchy, outermost first: engine state lock, per-table version
// lock, per-transaction workspace lock, per-page lock. The engine lock is
// never held across a table publish except where the publish itself is the
// table's first version.

use crate::buffer::{BufferPool, BufferPoolConfig, BufferPoolStats};
use crate::catalog::TableInfo;
use crate::common::{OperationContext, Row, RowId, Value};
use crate::error::DbError;
use crate::expr::{
    EvaluatorVirtuals, GeneratedColumnEvaluator, NullEvaluator, VirtualColumnCalculator,
};
use crate::index::{Index, IndexInfo, IndexKey, IndexKind, IndexManager};
use crate::mvcc::{TableData, TableVersions};
use crate::planner::{self, QueryPlan};
use crate::query::{paginate, sort_rows, Filter, QueryOptions, QueryResult};
use crate::storage::PagedRows;
use crate::txn::{CommitPayload, Snapshot, Transaction};
use crate::vector::{self, VectorIndex, VectorIndexConfig};
use crate::Result;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Rows between cancellation polls on scan loops.
const CANCEL_CHECK_INTERVAL: usize = 1024;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub read_only: bool,
    pub buffer_pool: BufferPoolConfig,
}

/// Handle returned by `begin_transaction`. Operations join the transaction
/// by carrying its id in their context.
#[derive(Debug, Clone, Copy)]
pub struct TransactionHandle {
    pub id: u64,
    pub read_only: bool,
}

impl TransactionHandle {
    pub fn context(&self) -> OperationContext {
        OperationContext::with_transaction(self.id)
    }
}

struct EngineState {
    tables: HashMap<String, Arc<TableVersions>>,
    temp_tables: HashSet<String>,
    current_version: u64,
    next_transaction_id: u64,
    transactions: HashMap<u64, Transaction>,
    snapshots: HashMap<u64, Arc<Snapshot>>,
    /// Keyed by "table.column".
    auto_increment: HashMap<String, i64>,
}

/// A unique constraint: a column-level flag or a unique index.
struct UniqueSet {
    key_name: String,
    columns: Vec<String>,
    index: Option<Arc<dyn Index>>,
}

pub struct Engine {
    config: EngineConfig,
    pool: Arc<BufferPool>,
    indexes: IndexManager,
    evaluator: Arc<dyn GeneratedColumnEvaluator>,
    virtuals: Arc<dyn VirtualColumnCalculator>,
    connected: AtomicBool,
    state: RwLock<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_evaluator(config, Arc::new(NullEvaluator))
    }

    pub fn with_evaluator(
        config: EngineConfig,
        evaluator: Arc<dyn GeneratedColumnEvaluator>,
    ) -> Self {
        let virtuals = Arc::new(EvaluatorVirtuals::new(evaluator.clone()));
        Self::with_collaborators(config, evaluator, virtuals)
    }

    pub fn with_collaborators(
        config: EngineConfig,
        evaluator: Arc<dyn GeneratedColumnEvaluator>,
        virtuals: Arc<dyn VirtualColumnCalculator>,
    ) -> Self {
        let pool = BufferPool::new(config.buffer_pool.clone());
        Self {
            config,
            pool,
            indexes: IndexManager::new(),
            evaluator,
            virtuals,
            connected: AtomicBool::new(false),
            state: RwLock::new(EngineState {
                tables: HashMap::new(),
                temp_tables: HashSet::new(),
                current_version: 0,
                next_transaction_id: 0,
                transactions: HashMap::new(),
                snapshots: HashMap::new(),
                auto_increment: HashMap::new(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn connect(&self, _ctx: &OperationContext) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        info!("engine connected");
        Ok(())
    }

    /// Disconnect, release every table version, drop all indexes, and shut
    /// down the buffer pool (spill files are removed best-effort).
    pub fn close(&self, _ctx: &OperationContext) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        let (tables, removed) = {
            let mut st = self.state.write();
            let tables: Vec<String> = st.tables.keys().cloned().collect();
            let removed: Vec<Arc<TableData>> = st
                .tables
                .values()
                .flat_map(|tv| tv.drain())
                .collect();
            st.tables.clear();
            st.temp_tables.clear();
            st.transactions.clear();
            st.snapshots.clear();
            st.auto_increment.clear();
            (tables, removed)
        };
        for data in removed {
            data.rows.release();
        }
        for table in tables {
            self.indexes.drop_table_indexes(&table);
        }
        self.pool.close();
        info!("engine closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        !self.config.read_only
    }

    pub fn supports_mvcc(&self) -> bool {
        true
    }

    pub fn buffer_pool_stats(&self) -> BufferPoolStats {
        self.pool.stats()
    }

    pub fn current_version(&self) -> u64 {
        self.state.read().current_version
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(DbError::NotConnected)
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.is_writable() {
            Ok(())
        } else {
            Err(DbError::NotWritable)
        }
    }

    // ------------------------------------------------------------------
    // Catalog surface
    // ------------------------------------------------------------------

    pub fn get_tables(&self, _ctx: &OperationContext) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let st = self.state.read();
        let mut names: Vec<String> = st
            .tables
            .keys()
            .filter(|name| !st.temp_tables.contains(*name))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn get_temporary_tables(&self, _ctx: &OperationContext) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let st = self.state.read();
        let mut names: Vec<String> = st.temp_tables.iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn get_all_tables(&self, _ctx: &OperationContext) -> Result<Vec<String>> {
        self.ensure_connected()?;
        let st = self.state.read();
        let mut names: Vec<String> = st.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn get_table_info(&self, _ctx: &OperationContext, table: &str) -> Result<TableInfo> {
        self.ensure_connected()?;
        let tv = self.table_versions(table)?;
        let data = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        Ok(data.schema.clone())
    }

    pub fn create_table(&self, ctx: &OperationContext, schema: TableInfo) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        schema.validate()?;

        let name = schema.name.clone();
        let mut st = self.state.write();
        if st.tables.contains_key(&name) {
            return Err(DbError::TableExists(name));
        }
        st.current_version += 1;
        let version = st.current_version;

        let tv = Arc::new(TableVersions::new(name.clone()));
        // First version installs while the registry entry is created, so no
        // reader can observe an empty chain.
        tv.publish(|_| {
            Ok(TableData::new(
                version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, &name, version, Vec::new()),
            ))
        })?;
        if schema.temporary {
            st.temp_tables.insert(name.clone());
        }
        st.tables.insert(name.clone(), tv);
        drop(st);

        self.pool.update_latest_version(&name, version);
        debug!(table = %name, version, "created table");
        Ok(())
    }

    pub fn drop_table(&self, ctx: &OperationContext, table: &str) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;

        let tv = {
            let mut st = self.state.write();
            let tv = st
                .tables
                .remove(table)
                .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
            st.temp_tables.remove(table);
            let prefix = format!("{}.", table);
            st.auto_increment.retain(|key, _| !key.starts_with(&prefix));
            tv
        };
        for data in tv.drain() {
            data.rows.release();
        }
        self.indexes.drop_table_indexes(table);
        debug!(table, "dropped table");
        Ok(())
    }

    pub fn truncate_table(&self, ctx: &OperationContext, table: &str) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;

        let tv = self.table_versions(table)?;
        let schema = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?
            .schema
            .clone();

        let new_version = self.bump_version();
        let result = tv.publish(|_| {
            self.indexes.rebuild(table, &schema, &[])?;
            Ok(TableData::new(
                new_version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, table, new_version, Vec::new()),
            ))
        });
        if let Err(e) = result {
            self.unbump_version(new_version);
            return Err(e);
        }
        self.pool.update_latest_version(table, new_version);
        self.collect_old_versions();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Index surface
    // ------------------------------------------------------------------

    pub fn create_index(
        &self,
        ctx: &OperationContext,
        table: &str,
        name: Option<String>,
        columns: Vec<String>,
        kind: IndexKind,
        unique: bool,
    ) -> Result<Arc<dyn Index>> {
        self.ensure_connected()?;
        ctx.check_cancelled()?;
        let tv = self.table_versions(table)?;
        let index = self.indexes.create_index(table, name, columns, kind, unique)?;

        // Populate from the latest committed rows.
        if let Some(data) = tv.latest() {
            let rows = data.materialize()?;
            self.indexes.rebuild(table, &data.schema, &rows)?;
        }
        Ok(index)
    }

    pub fn drop_index(&self, ctx: &OperationContext, table: &str, name: &str) -> Result<()> {
        self.ensure_connected()?;
        ctx.check_cancelled()?;
        self.table_versions(table)?;
        self.indexes.drop_index(table, name)
    }

    pub fn list_indexes(&self, table: &str) -> Vec<IndexInfo> {
        self.indexes.list_indexes(table)
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.indexes
    }

    pub fn create_vector_index(
        &self,
        ctx: &OperationContext,
        table: &str,
        column: &str,
        kind: IndexKind,
        metric: &str,
        dimension: usize,
        params: HashMap<String, f64>,
    ) -> Result<Arc<dyn VectorIndex>> {
        self.ensure_connected()?;
        ctx.check_cancelled()?;
        let tv = self.table_versions(table)?;

        let config = VectorIndexConfig {
            name: format!("vec_{}_{}", table, column),
            table: table.to_string(),
            column: column.to_string(),
            kind,
            metric: metric.to_string(),
            dimension,
            params,
        };
        let index = vector::create_vector_index(config)?;
        self.indexes
            .register_vector_index(table, column, index.clone())?;

        // Backfill from the latest committed rows.
        if let Some(data) = tv.latest() {
            let rows = data.materialize()?;
            let mut position = 0usize;
            index.build(&mut || {
                while position < rows.len() {
                    let row_id = position as RowId + 1;
                    let vector = rows[position].get(column).and_then(|v| v.as_vector());
                    position += 1;
                    if let Some(vector) = vector {
                        return Ok(Some((row_id, vector.to_vec())));
                    }
                }
                Ok(None)
            })?;
        }
        Ok(index)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn query(
        &self,
        ctx: &OperationContext,
        table: &str,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        self.ensure_connected()?;
        ctx.check_cancelled()?;

        if let Some(txn_id) = ctx.transaction_id {
            let (_, snapshot) = self.transaction_parts(txn_id)?;
            if let Some(cow) = snapshot.table(table) {
                let tv = self.table_versions(table)?;
                let (schema, mut rows) = cow.visible(&tv)?;
                // Workspace reads always scan: the shared indexes describe
                // the latest committed version, not this snapshot.
                rows = self.filter_scan(ctx, rows, options)?;
                return self.finish_query(ctx, schema, rows, options);
            }
            // Table created after BEGIN: fall through to a committed read.
        }

        let tv = self.table_versions(table)?;
        let data = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let schema = data.schema.clone();

        let rows = match planner::plan(table, &options.filters, &self.indexes) {
            QueryPlan::IndexScan {
                index,
                value,
                filter_pos,
            } => match self.index_scan(ctx, &data, &index, &value, filter_pos, options) {
                Ok(rows) => rows,
                Err(e) => {
                    // The planner is the one place errors downgrade instead
                    // of surfacing: fall back to a full scan.
                    debug!(table, error = %e, "index probe failed, falling back to full scan");
                    self.filter_scan(ctx, data.materialize()?, options)?
                }
            },
            QueryPlan::FullScan => self.filter_scan(ctx, data.materialize()?, options)?,
        };
        self.finish_query(ctx, schema, rows, options)
    }

    fn index_scan(
        &self,
        ctx: &OperationContext,
        data: &Arc<TableData>,
        index: &Arc<dyn Index>,
        value: &Value,
        consumed_filter: usize,
        options: &QueryOptions,
    ) -> Result<Vec<Row>> {
        let mut ids = planner::probe(index, value, &data.schema)?;
        ids.sort_unstable();
        let mut rows = Vec::with_capacity(ids.len());
        for (n, id) in ids.iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check_cancelled()?;
            }
            if *id == 0 {
                continue;
            }
            let Some(row) = data.rows.get(*id as usize - 1)? else {
                continue;
            };
            let residual_match = options
                .filters
                .iter()
                .enumerate()
                .all(|(i, f)| i == consumed_filter || f.matches(&row));
            if residual_match {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    fn filter_scan(
        &self,
        ctx: &OperationContext,
        rows: Vec<Row>,
        options: &QueryOptions,
    ) -> Result<Vec<Row>> {
        let mut out = Vec::new();
        for (n, row) in rows.into_iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 {
                ctx.check_cancelled()?;
            }
            if options.matches(&row) {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Shared tail of both scan paths: virtual columns, ordering,
    /// pre-pagination total, offset/limit.
    fn finish_query(
        &self,
        ctx: &OperationContext,
        schema: TableInfo,
        mut rows: Vec<Row>,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        ctx.check_cancelled()?;
        if self.virtuals.has_virtual_columns(&schema) {
            if let Err(e) = self.virtuals.calculate_batch(&mut rows, &schema) {
                // Virtual columns degrade to NULL, never fail the query.
                warn!(table = %schema.name, error = %e, "virtual column batch failed");
                for row in rows.iter_mut() {
                    for column in schema.columns.iter().filter(|c| c.is_virtual()) {
                        row.insert(column.name.clone(), Value::Null);
                    }
                }
            }
        }
        sort_rows(&mut rows, &options.order_by);
        let total = rows.len();
        let rows = paginate(rows, options.offset, options.limit);
        Ok(QueryResult {
            columns: schema.column_names(),
            rows,
            total,
        })
    }

    pub fn get_latest_table_data(&self, table: &str) -> Result<(TableInfo, Vec<Row>)> {
        let tv = self.table_versions(table)?;
        let data = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        Ok((data.schema.clone(), data.materialize()?))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn insert(&self, ctx: &OperationContext, table: &str, rows: Vec<Row>) -> Result<usize> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        if ctx.transaction_id.is_some() {
            return self.transactional_insert(ctx, table, rows);
        }

        let tv = self.table_versions(table)?;
        let latest = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let schema = latest.schema.clone();

        let mut rows = rows;
        self.prepare_insert_rows(table, &schema, &mut rows)?;
        if rows.is_empty() {
            return Ok(0);
        }
        let count = rows.len();
        let sets = self.unique_sets(table, &schema);

        let new_version = self.bump_version();
        let published = tv.publish(|base| {
            ctx.check_cancelled()?;
            // Deep copy: the new version never shares row objects with the
            // old one.
            let mut all = match base {
                Some(data) => data.rows.to_vec()?,
                None => Vec::new(),
            };
            self.check_unique_insert(&sets, &schema, &all, &rows)?;
            all.extend(rows.iter().cloned());
            // Rebuild under the table lock so the next probe sees the
            // version being installed.
            self.indexes.rebuild(table, &schema, &all)?;
            Ok(TableData::new(
                new_version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, table, new_version, all),
            ))
        });
        if let Err(e) = published {
            self.unbump_version(new_version);
            return Err(e);
        }

        self.pool.update_latest_version(table, new_version);
        self.collect_old_versions();
        Ok(count)
    }

    pub fn update(
        &self,
        ctx: &OperationContext,
        table: &str,
        filters: &[Filter],
        updates: Row,
    ) -> Result<usize> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        if ctx.transaction_id.is_some() {
            return self.transactional_update(ctx, table, filters, updates);
        }

        let tv = self.table_versions(table)?;
        let latest = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let schema = latest.schema.clone();

        let mut updates = updates;
        self.evaluator.filter_generated_columns(&mut updates, &schema);
        let updated_columns: Vec<String> = updates.keys().cloned().collect();
        let sets = self.unique_sets(table, &schema);

        let mut affected = 0usize;
        let new_version = self.bump_version();
        let published = tv.try_publish(|base| {
            ctx.check_cancelled()?;
            let mut all = match base {
                Some(data) => data.rows.to_vec()?,
                None => Vec::new(),
            };
            for (n, row) in all.iter_mut().enumerate() {
                if n % CANCEL_CHECK_INTERVAL == 0 {
                    ctx.check_cancelled()?;
                }
                if !filters.iter().all(|f| f.matches(row)) {
                    continue;
                }
                for (column, value) in &updates {
                    row.insert(column.clone(), value.clone());
                }
                self.evaluator.evaluate_affected(row, &updated_columns, &schema)?;
                affected += 1;
            }
            if affected == 0 {
                return Ok(None);
            }
            self.check_unique_slice(&sets, &schema, &all)?;
            self.indexes.rebuild(table, &schema, &all)?;
            Ok(Some(TableData::new(
                new_version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, table, new_version, all),
            )))
        });

        match published {
            Ok(Some(_)) => {
                self.pool.update_latest_version(table, new_version);
                self.collect_old_versions();
                Ok(affected)
            }
            Ok(None) => {
                self.unbump_version(new_version);
                Ok(0)
            }
            Err(e) => {
                self.unbump_version(new_version);
                Err(e)
            }
        }
    }

    pub fn delete(
        &self,
        ctx: &OperationContext,
        table: &str,
        filters: &[Filter],
    ) -> Result<usize> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        if ctx.transaction_id.is_some() {
            return self.transactional_delete(ctx, table, filters);
        }

        let tv = self.table_versions(table)?;
        let latest = tv
            .latest()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))?;
        let schema = latest.schema.clone();

        let mut removed = 0usize;
        let new_version = self.bump_version();
        let published = tv.try_publish(|base| {
            ctx.check_cancelled()?;
            let all = match base {
                Some(data) => data.rows.to_vec()?,
                None => Vec::new(),
            };
            let mut retained = Vec::with_capacity(all.len());
            for (n, row) in all.into_iter().enumerate() {
                if n % CANCEL_CHECK_INTERVAL == 0 {
                    ctx.check_cancelled()?;
                }
                if filters.iter().all(|f| f.matches(&row)) {
                    removed += 1;
                } else {
                    retained.push(row);
                }
            }
            if removed == 0 {
                return Ok(None);
            }
            self.indexes.rebuild(table, &schema, &retained)?;
            Ok(Some(TableData::new(
                new_version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, table, new_version, retained),
            )))
        });

        match published {
            Ok(Some(_)) => {
                self.pool.update_latest_version(table, new_version);
                self.collect_old_versions();
                Ok(removed)
            }
            Ok(None) => {
                self.unbump_version(new_version);
                Ok(0)
            }
            Err(e) => {
                self.unbump_version(new_version);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Load paths
    // ------------------------------------------------------------------

    /// Publish a version containing exactly `rows` and rebuild the table's
    /// indexes. Creates the table if it does not exist.
    pub fn load_table(
        &self,
        ctx: &OperationContext,
        schema: TableInfo,
        rows: Vec<Row>,
    ) -> Result<()> {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        schema.validate()?;

        let table = schema.name.clone();
        let (tv, new_version) = self.table_for_load(&schema);
        let result = tv.publish(|_| {
            ctx.check_cancelled()?;
            self.indexes.rebuild(&table, &schema, &rows)?;
            Ok(TableData::new(
                new_version,
                schema.clone(),
                PagedRows::from_rows(&self.pool, &table, new_version, rows),
            ))
        });
        if let Err(e) = result {
            self.unbump_version(new_version);
            return Err(e);
        }

        self.pool.update_latest_version(&table, new_version);
        self.collect_old_versions();
        Ok(())
    }

    /// Incremental load: the loader receives an `add_page` callback and row
    /// memory never peaks as one flat slice. The buffer pool may evict
    /// pages while the load is still running.
    pub fn bulk_load<F>(&self, ctx: &OperationContext, schema: TableInfo, load: F) -> Result<()>
    where
        F: FnOnce(&mut dyn FnMut(Vec<Row>) -> Result<()>) -> Result<()>,
    {
        self.ensure_connected()?;
        self.ensure_writable()?;
        ctx.check_cancelled()?;
        schema.validate()?;

        let table = schema.name.clone();
        let (tv, new_version) = self.table_for_load(&schema);

        let mut builder = PagedRows::builder(&self.pool, &table, new_version);
        let loaded = {
            let ctx = ctx.clone();
            let mut add_page = |rows: Vec<Row>| -> Result<()> {
                ctx.check_cancelled()?;
                builder.add_page(rows);
                Ok(())
            };
            load(&mut add_page)
        };
        let paged = builder.finish();

        if let Err(e) = loaded.and_then(|_| ctx.check_cancelled()) {
            // No partial publication: drop the staged pages and the version.
            paged.release();
            self.unbump_version(new_version);
            return Err(e);
        }

        let result = tv.publish(|_| {
            ctx.check_cancelled()?;
            let all_rows = paged.to_vec()?;
            self.indexes.rebuild(&table, &schema, &all_rows)?;
            Ok(TableData::new(new_version, schema.clone(), paged.clone()))
        });
        if let Err(e) = result {
            paged.release();
            self.unbump_version(new_version);
            return Err(e);
        }

        self.pool.update_latest_version(&table, new_version);
        self.collect_old_versions();
        Ok(())
    }

    fn table_for_load(&self, schema: &TableInfo) -> (Arc<TableVersions>, u64) {
        let mut st = self.state.write();
        st.current_version += 1;
        let version = st.current_version;
        let tv = st
            .tables
            .entry(schema.name.clone())
            .or_insert_with(|| Arc::new(TableVersions::new(schema.name.clone())))
            .clone();
        if schema.temporary {
            st.temp_tables.insert(schema.name.clone());
        }
        (tv, version)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(
        &self,
        ctx: &OperationContext,
        read_only: bool,
    ) -> Result<TransactionHandle> {
        self.ensure_connected()?;
        ctx.check_cancelled()?;

        let mut st = self.state.write();
        st.next_transaction_id += 1;
        let id = st.next_transaction_id;
        let transaction = Transaction {
            id,
            start_time: Utc::now(),
            read_only,
        };
        // Pinning each table's latest version here is what yields snapshot
        // isolation: later publishes do not retarget the snapshot.
        let pins: Vec<(String, u64)> = st
            .tables
            .iter()
            .map(|(name, tv)| (name.clone(), tv.latest_version()))
            .collect();
        let snapshot = Arc::new(Snapshot::new(id, st.current_version, pins));
        st.transactions.insert(id, transaction);
        st.snapshots.insert(id, snapshot);
        debug!(transaction = id, read_only, "transaction started");
        Ok(TransactionHandle { id, read_only })
    }

    pub fn commit(&self, ctx: &OperationContext) -> Result<()> {
        self.ensure_connected()?;
        let txn_id = ctx
            .transaction_id
            .ok_or(DbError::TransactionNotFound(0))?;
        let (transaction, snapshot) = self.transaction_parts(txn_id)?;

        if transaction.read_only {
            self.finish_transaction(txn_id);
            return Ok(());
        }

        for cow in snapshot.modified_tables() {
            let table = cow.table().to_string();
            let Ok(tv) = self.table_versions(&table) else {
                warn!(table = %table, transaction = txn_id, "modified table dropped before commit");
                continue;
            };
            let Some(payload) = cow.commit_payload()? else {
                continue;
            };
            let schema = payload.schema.clone();
            let sets = self.unique_sets(&table, &schema);

            let new_version = self.bump_version();
            let result = tv.publish(|latest| {
                self.check_unique_commit(&sets, &schema, &payload, latest)?;
                self.indexes.rebuild(&table, &schema, &payload.rows)?;
                Ok(TableData::new(
                    new_version,
                    schema.clone(),
                    PagedRows::from_rows(&self.pool, &table, new_version, payload.rows.clone()),
                ))
            });
            if let Err(e) = result {
                // Reverse the pre-increment and clean the transaction up;
                // the caller decides whether to retry.
                self.unbump_version(new_version);
                self.finish_transaction(txn_id);
                return Err(e);
            }

            self.pool.update_latest_version(&table, new_version);
        }

        self.finish_transaction(txn_id);
        debug!(transaction = txn_id, "transaction committed");
        Ok(())
    }

    pub fn rollback(&self, ctx: &OperationContext) -> Result<()> {
        self.ensure_connected()?;
        let txn_id = ctx
            .transaction_id
            .ok_or(DbError::TransactionNotFound(0))?;
        self.transaction_parts(txn_id)?;
        self.finish_transaction(txn_id);
        debug!(transaction = txn_id, "transaction rolled back");
        Ok(())
    }

    fn transaction_parts(&self, txn_id: u64) -> Result<(Transaction, Arc<Snapshot>)> {
        let st = self.state.read();
        let transaction = st
            .transactions
            .get(&txn_id)
            .cloned()
            .ok_or(DbError::TransactionNotFound(txn_id))?;
        let snapshot = st
            .snapshots
            .get(&txn_id)
            .cloned()
            .ok_or(DbError::SnapshotNotFound(txn_id))?;
        Ok((transaction, snapshot))
    }

    fn transactional_insert(
        &self,
        ctx: &OperationContext,
        table: &str,
        rows: Vec<Row>,
    ) -> Result<usize> {
        let txn_id = ctx.transaction_id.unwrap_or_default();
        let (transaction, snapshot) = self.transaction_parts(txn_id)?;
        if transaction.read_only {
            return Err(DbError::NotWritable);
        }
        let tv = self.table_versions(table)?;
        let cow = snapshot.table_or_pin(table, tv.latest_version());
        cow.ensure_copied(&tv)?;
        let schema = cow.schema()?;

        let mut rows = rows;
        self.prepare_insert_rows(table, &schema, &mut rows)?;
        cow.insert_rows(rows)
    }

    fn transactional_update(
        &self,
        ctx: &OperationContext,
        table: &str,
        filters: &[Filter],
        updates: Row,
    ) -> Result<usize> {
        let txn_id = ctx.transaction_id.unwrap_or_default();
        let (transaction, snapshot) = self.transaction_parts(txn_id)?;
        if transaction.read_only {
            return Err(DbError::NotWritable);
        }
        let tv = self.table_versions(table)?;
        let cow = snapshot.table_or_pin(table, tv.latest_version());
        cow.ensure_copied(&tv)?;
        let schema = cow.schema()?;

        let mut updates = updates;
        self.evaluator.filter_generated_columns(&mut updates, &schema);
        cow.update_rows(filters, &updates, self.evaluator.as_ref())
    }

    fn transactional_delete(
        &self,
        ctx: &OperationContext,
        table: &str,
        filters: &[Filter],
    ) -> Result<usize> {
        let txn_id = ctx.transaction_id.unwrap_or_default();
        let (transaction, snapshot) = self.transaction_parts(txn_id)?;
        if transaction.read_only {
            return Err(DbError::NotWritable);
        }
        let tv = self.table_versions(table)?;
        let cow = snapshot.table_or_pin(table, tv.latest_version());
        cow.ensure_copied(&tv)?;
        cow.delete_rows(filters)
    }

    // ------------------------------------------------------------------
    // Version bookkeeping
    // ------------------------------------------------------------------

    fn table_versions(&self, table: &str) -> Result<Arc<TableVersions>> {
        self.state
            .read()
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(table.to_string()))
    }

    fn bump_version(&self) -> u64 {
        let mut st = self.state.write();
        st.current_version += 1;
        st.current_version
    }

    /// Reverse a pre-incremented version after an aborted publication, so
    /// observed versions keep the one-per-published-change property.
    fn unbump_version(&self, version: u64) {
        let mut st = self.state.write();
        if st.current_version == version {
            st.current_version -= 1;
        }
    }

    /// Drop versions no snapshot references. Runs at the end of every
    /// commit/rollback and after non-transactional publishes.
    fn collect_old_versions(&self) {
        let removed = {
            let st = self.state.read();
            let min_required = st
                .snapshots
                .values()
                .map(|s| s.start_version)
                .min()
                .unwrap_or(st.current_version);
            let mut pinned_by_table: HashMap<String, HashSet<u64>> = HashMap::new();
            for snapshot in st.snapshots.values() {
                for (table, version) in snapshot.pins() {
                    pinned_by_table.entry(table).or_default().insert(version);
                }
            }
            let mut removed = Vec::new();
            for (name, tv) in &st.tables {
                let pinned = pinned_by_table.remove(name).unwrap_or_default();
                removed.extend(tv.gc(min_required, &pinned));
            }
            removed
        };
        if !removed.is_empty() {
            debug!(count = removed.len(), "garbage-collected table versions");
        }
        for data in removed {
            data.rows.release();
        }
    }

    fn finish_transaction(&self, txn_id: u64) {
        {
            let mut st = self.state.write();
            st.transactions.remove(&txn_id);
            st.snapshots.remove(&txn_id);
        }
        self.collect_old_versions();
    }

    // ------------------------------------------------------------------
    // Row preparation and unique constraints
    // ------------------------------------------------------------------

    /// Defaults, auto-increment, generated columns: shared by the
    /// transactional and non-transactional insert paths.
    fn prepare_insert_rows(
        &self,
        table: &str,
        schema: &TableInfo,
        rows: &mut [Row],
    ) -> Result<()> {
        for row in rows.iter_mut() {
            // Callers may not supply generated-column values.
            self.evaluator.filter_generated_columns(row, schema);
            for column in &schema.columns {
                if column.generated.is_some() || column.auto_increment {
                    continue;
                }
                if !row.contains_key(&column.name) {
                    if let Some(default) = &column.default {
                        row.insert(column.name.clone(), default.clone());
                    }
                }
            }
        }
        self.fill_auto_increment(table, schema, rows)?;
        for row in rows.iter_mut() {
            self.evaluator.evaluate_all(row, schema)?;
        }
        Ok(())
    }

    /// Absent, NULL, or zero auto-increment values take the next counter
    /// value; larger supplied values raise the counter.
    fn fill_auto_increment(
        &self,
        table: &str,
        schema: &TableInfo,
        rows: &mut [Row],
    ) -> Result<()> {
        let auto_columns: Vec<&str> = schema
            .columns
            .iter()
            .filter(|c| c.auto_increment)
            .map(|c| c.name.as_str())
            .collect();
        if auto_columns.is_empty() {
            return Ok(());
        }

        let mut st = self.state.write();
        for row in rows.iter_mut() {
            for column in &auto_columns {
                let key = format!("{}.{}", table, column);
                let counter = st.auto_increment.entry(key).or_insert(0);
                let supplied = row.get(*column);
                let take_next = supplied
                    .map(|v| v.is_null() || v.is_numeric_zero())
                    .unwrap_or(true);
                if take_next {
                    *counter += 1;
                    row.insert(column.to_string(), Value::Int64(*counter));
                } else if let Some(v) = supplied.and_then(Value::as_i64) {
                    if v > *counter {
                        *counter = v;
                    }
                }
            }
        }
        Ok(())
    }

    /// Column-level primary/unique flags plus unique indexes.
    fn unique_sets(&self, table: &str, schema: &TableInfo) -> Vec<UniqueSet> {
        let unique_indexes = self.indexes.unique_indexes(table);
        let mut sets = Vec::new();
        for column in &schema.columns {
            if !column.primary_key && !column.unique {
                continue;
            }
            let columns = vec![column.name.clone()];
            let index = unique_indexes
                .iter()
                .find(|i| i.info().columns == columns)
                .cloned();
            sets.push(UniqueSet {
                key_name: column.name.clone(),
                columns,
                index,
            });
        }
        for index in unique_indexes {
            if sets.iter().any(|s| s.columns == index.info().columns) {
                continue;
            }
            sets.push(UniqueSet {
                key_name: index.info().name.clone(),
                columns: index.info().columns.clone(),
                index: Some(index),
            });
        }
        sets
    }

    fn duplicate_entry(set: &UniqueSet, key: &IndexKey) -> DbError {
        DbError::DuplicateEntry {
            value: key.to_string(),
            key: set.key_name.clone(),
        }
    }

    /// Insert-path check: in-batch duplicates, plus conflicts against the
    /// current rows (unique indexes are probed; flag-only constraints scan).
    fn check_unique_insert(
        &self,
        sets: &[UniqueSet],
        schema: &TableInfo,
        existing_rows: &[Row],
        new_rows: &[Row],
    ) -> Result<()> {
        for set in sets {
            let existing_keys: Option<HashSet<IndexKey>> = if set.index.is_none() {
                let mut keys = HashSet::new();
                for row in existing_rows {
                    if let Some(key) = IndexKey::from_row(row, &set.columns, Some(schema))? {
                        keys.insert(key);
                    }
                }
                Some(keys)
            } else {
                None
            };

            let mut batch = HashSet::new();
            for row in new_rows {
                let Some(key) = IndexKey::from_row(row, &set.columns, Some(schema))? else {
                    continue;
                };
                if !batch.insert(key.clone()) {
                    return Err(Self::duplicate_entry(set, &key));
                }
                let conflict = match (&set.index, &existing_keys) {
                    (Some(index), _) => !index.find(&key)?.is_empty(),
                    (None, Some(keys)) => keys.contains(&key),
                    (None, None) => false,
                };
                if conflict {
                    return Err(Self::duplicate_entry(set, &key));
                }
            }
        }
        Ok(())
    }

    /// Duplicate scan over a complete candidate slice.
    fn check_unique_slice(
        &self,
        sets: &[UniqueSet],
        schema: &TableInfo,
        rows: &[Row],
    ) -> Result<()> {
        for set in sets {
            let mut seen = HashSet::new();
            for row in rows {
                let Some(key) = IndexKey::from_row(row, &set.columns, Some(schema))? else {
                    continue;
                };
                if !seen.insert(key.clone()) {
                    return Err(Self::duplicate_entry(set, &key));
                }
            }
        }
        Ok(())
    }

    /// Commit-path check: the merged slice must be internally consistent,
    /// and every key the transaction added or changed must not collide with
    /// the latest committed version (which may have advanced past the
    /// pinned base). A modified row whose key did not change skips the
    /// probe, as the hit would be its own committed copy.
    fn check_unique_commit(
        &self,
        sets: &[UniqueSet],
        schema: &TableInfo,
        payload: &CommitPayload,
        latest: Option<&Arc<TableData>>,
    ) -> Result<()> {
        self.check_unique_slice(sets, schema, &payload.rows)?;
        if payload.changed.is_empty() {
            return Ok(());
        }

        let needs_scan = sets.iter().any(|s| s.index.is_none());
        let latest_rows: Option<Vec<Row>> = if needs_scan {
            match latest {
                Some(data) => Some(data.rows.to_vec()?),
                None => None,
            }
        } else {
            None
        };

        for set in sets {
            let latest_keys: Option<HashSet<IndexKey>> = if set.index.is_none() {
                let mut keys = HashSet::new();
                if let Some(rows) = &latest_rows {
                    for row in rows {
                        if let Some(key) = IndexKey::from_row(row, &set.columns, Some(schema))? {
                            keys.insert(key);
                        }
                    }
                }
                Some(keys)
            } else {
                None
            };

            for changed in &payload.changed {
                let Some(key) = IndexKey::from_row(&changed.row, &set.columns, Some(schema))?
                else {
                    continue;
                };
                if let Some(base) = &changed.base {
                    if let Some(base_key) = IndexKey::from_row(base, &set.columns, Some(schema))? {
                        if base_key == key {
                            continue;
                        }
                    }
                }
                let conflict = match (&set.index, &latest_keys) {
                    (Some(index), _) => !index.find(&key)?.is_empty(),
                    (None, Some(keys)) => keys.contains(&key),
                    (None, None) => false,
                };
                if conflict {
                    return Err(Self::duplicate_entry(set, &key));
                }
            }
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.is_connected() {
            let _ = self.close(&OperationContext::new());
        }
    }
}
