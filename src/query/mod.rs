// Query surface: filters, ordering, pagination, and row matching.

use crate::common::{Row, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Like,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Whether the row satisfies this filter. A missing column reads as
    /// NULL; NULL only ever matches an equality against NULL.
    pub fn matches(&self, row: &Row) -> bool {
        let actual = row.get(&self.field).unwrap_or(&Value::Null);

        if actual.is_null() || (self.value.is_null() && self.op != FilterOp::Eq) {
            return self.op == FilterOp::Eq && actual.is_null() && self.value.is_null();
        }

        match self.op {
            FilterOp::Eq => actual.loose_eq(&self.value),
            FilterOp::Ne => matches!(
                actual.compare(&self.value),
                Some(Ordering::Less) | Some(Ordering::Greater)
            ),
            FilterOp::Lt => actual.compare(&self.value) == Some(Ordering::Less),
            FilterOp::Le => matches!(
                actual.compare(&self.value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            FilterOp::Gt => actual.compare(&self.value) == Some(Ordering::Greater),
            FilterOp::Ge => matches!(
                actual.compare(&self.value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            FilterOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|v| actual.loose_eq(v)),
                _ => false,
            },
            FilterOp::Like => match (actual, &self.value) {
                (Value::String(s), Value::String(pattern)) => like_matches(pattern, s),
                _ => false,
            },
        }
    }
}

/// SQL LIKE: `%` matches any run, `_` a single character. Case-insensitive.
pub fn like_matches(pattern: &str, text: &str) -> bool {
    let mut regex = String::with_capacity(pattern.len() + 8);
    regex.push_str("(?i)^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
    /// Zero means unlimited.
    pub limit: usize,
    pub offset: usize,
    /// Kept for API compatibility with callers that distinguish SELECT *;
    /// the engine always returns the schema's columns.
    pub select_all: bool,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.filters.iter().all(|f| f.matches(row))
    }
}

/// Query output: schema columns, the page of rows, and the pre-pagination
/// match count.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total: usize,
}

/// Stable multi-key sort by the order-by list.
pub fn sort_rows(rows: &mut [Row], order_by: &[OrderBy]) {
    if order_by.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for key in order_by {
            let left = a.get(&key.column).unwrap_or(&Value::Null);
            let right = b.get(&key.column).unwrap_or(&Value::Null);
            let ord = left.compare(right).unwrap_or(Ordering::Equal);
            let ord = if key.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Apply offset and limit (limit zero = unlimited).
pub fn paginate(rows: Vec<Row>, offset: usize, limit: usize) -> Vec<Row> {
    let mut iter = rows.into_iter().skip(offset);
    if limit > 0 {
        iter.by_ref().take(limit).collect()
    } else {
        iter.collect()
    }
}
