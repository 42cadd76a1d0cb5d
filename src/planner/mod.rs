// Query planner.
//
// Deterministic and single-step: exactly one equality filter backed by a
// BTree or Hash index turns into a point probe; everything else is a full
// scan. A probe failure downgrades to a full scan so a query never fails
// for lack of optimization.

use crate::catalog::TableInfo;
use crate::common::{RowId, Value};
use crate::index::{Index, IndexKey, IndexKind, IndexManager};
use crate::query::Filter;
use crate::query::FilterOp;
use crate::Result;
use std::sync::Arc;
use tracing::debug;

pub enum QueryPlan {
    FullScan,
    IndexScan {
        index: Arc<dyn Index>,
        /// The equality value being probed.
        value: Value,
        /// Index of the consumed filter within the filter list.
        filter_pos: usize,
    },
}

/// Choose a plan for a filtered read on one table.
pub fn plan(table: &str, filters: &[Filter], indexes: &IndexManager) -> QueryPlan {
    let mut equality: Option<(usize, &Filter)> = None;
    for (pos, filter) in filters.iter().enumerate() {
        if filter.op == FilterOp::Eq {
            if equality.is_some() {
                // More than one equality filter: single-step planning bails.
                return QueryPlan::FullScan;
            }
            equality = Some((pos, filter));
        }
    }
    let Some((filter_pos, filter)) = equality else {
        return QueryPlan::FullScan;
    };

    let Some(index) = indexes.index_for_column(table, &filter.field) else {
        return QueryPlan::FullScan;
    };
    let info = index.info();
    if !matches!(info.kind, IndexKind::BTree | IndexKind::Hash) || info.columns.len() != 1 {
        return QueryPlan::FullScan;
    }

    debug!(table, column = %filter.field, index = %info.name, "planned index scan");
    QueryPlan::IndexScan {
        index,
        value: filter.value.clone(),
        filter_pos,
    }
}

/// Probe the chosen index for matching row ids, coercing the probe value
/// through the column's declared type.
pub fn probe(index: &Arc<dyn Index>, value: &Value, schema: &TableInfo) -> Result<Vec<RowId>> {
    let column = &index.info().columns[0];
    let declared = schema.column(column).map(|c| c.data_type);
    let key = IndexKey::from_values_typed(std::slice::from_ref(value), &[declared])?;
    index.find(&key)
}
