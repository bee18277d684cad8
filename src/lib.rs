// ============================================================================
// txnest Library
// ============================================================================
//
// A nested-transaction coordinator that sits between a data-access layer
// and a set of interchangeable storage adapters. Transactions may nest
// arbitrarily; inner transactions become savepoints on backends that
// support them, each execution context tracks exactly one current
// transaction per adapter, and every connection acquired while a
// transaction is active is the transaction's own connection rather than a
// fresh pooled one.
//
// ============================================================================

pub mod adapter;
pub mod context;
pub mod core;
pub mod primitive;
pub mod transaction;

#[cfg(feature = "memory")]
pub mod memory;

// Re-export main types for convenience
pub use crate::core::{AdapterId, Result, TxError, TxId};
pub use adapter::{ConnectionSource, TransactionAware, TransactionalSource};
pub use context::{ActiveTransaction, TxContext};
pub use primitive::{
    Connection, ConnectionRef, FlattenedPrimitive, Nesting, TransactionPrimitive, same_connection,
};
pub use transaction::{Transaction, TransactionInfo, TxOptions, TxState};

use std::sync::Arc;

// ============================================================================
// High-level Repository API
// ============================================================================

/// An adapter scoped to an execution context.
///
/// This is the recommended way to open transactions from application code.
/// Every `transaction` call on the same repository shares one context, so a
/// call made inside another call's block automatically becomes a savepoint
/// of the outer transaction — no transaction object needs to be passed
/// around.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use txnest::memory::MemoryAdapter;
/// use txnest::{ConnectionSource, Repository, TxContext, TxError};
/// use serde_json::json;
///
/// # fn main() -> Result<(), TxError> {
/// let context = TxContext::new();
/// let adapter = Arc::new(MemoryAdapter::new("memory://primary"));
/// let repo = Repository::new(context.clone(), adapter.clone());
/// let source = adapter.source(&context);
///
/// repo.transaction(|_tx| {
///     let conn = source.acquire()?;
///     adapter.session(&conn)?.put("user:1", json!({ "name": "alice" }));
///     source.release(conn);
///     Ok::<_, TxError>(())
/// })?;
///
/// assert_eq!(adapter.store().len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct Repository {
    context: TxContext,
    adapter: Arc<dyn TransactionAware>,
}

impl Repository {
    pub fn new(context: TxContext, adapter: Arc<dyn TransactionAware>) -> Self {
        Self { context, adapter }
    }

    pub fn context(&self) -> &TxContext {
        &self.context
    }

    pub fn adapter(&self) -> &Arc<dyn TransactionAware> {
        &self.adapter
    }

    /// A fresh transaction over this repository's adapter, not yet begun.
    /// Use this when the begin/commit calls need to be driven explicitly;
    /// prefer `transaction` otherwise.
    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.context.clone(), vec![self.adapter.clone()])
    }

    /// Run a block inside a transaction on this repository's adapter.
    ///
    /// Commits when the block returns `Ok`, rolls back (to a savepoint,
    /// when nested inside another `transaction` block on the same
    /// repository) when it returns `Err`, and propagates the block's value
    /// or error either way.
    pub fn transaction<T, E, F>(&self, block: F) -> std::result::Result<T, E>
    where
        E: From<TxError>,
        F: FnOnce(&mut Transaction) -> std::result::Result<T, E>,
    {
        let mut tx = self.new_transaction();
        tx.run(block)
    }
}
