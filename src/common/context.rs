// Explicit per-operation context.
//
// Higher layers attach a transaction id and an optional cancellation flag to
// every call; the engine reads both from this object. There is no
// thread-local or hidden state.

use crate::error::{DbError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Transaction the operation is bound to, if any. Reads and writes with
    /// a binding are routed through the transaction workspace.
    pub transaction_id: Option<u64>,

    cancel: Option<Arc<AtomicBool>>,
}

impl OperationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to a transaction.
    pub fn with_transaction(transaction_id: u64) -> Self {
        Self {
            transaction_id: Some(transaction_id),
            cancel: None,
        }
    }

    /// Context plus a cancellation flag the caller can trip from another
    /// thread.
    pub fn cancellable() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        let ctx = Self {
            transaction_id: None,
            cancel: Some(flag.clone()),
        };
        (ctx, flag)
    }

    pub fn bind_transaction(mut self, transaction_id: u64) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Polled at natural boundaries: before scans, between large row loops,
    /// around bulk-load index rebuilds.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DbError::Cancelled)
        } else {
            Ok(())
        }
    }
}
