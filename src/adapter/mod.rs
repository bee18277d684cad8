// ============================================================================
// Adapter Integration
// ============================================================================
//
// What a storage adapter implements to participate in coordinated
// transactions, and the shim that makes connection acquisition
// transaction-aware without changing the pool's contract.
//
// ============================================================================

use std::sync::Arc;

use crate::context::TxContext;
use crate::core::{AdapterId, Result};
use crate::primitive::{ConnectionRef, Nesting, TransactionPrimitive, same_connection};

/// The existing connection-acquisition boundary of an adapter, usually a
/// pool. The coordinator wraps this, it never replaces it.
pub trait ConnectionSource: Send + Sync {
    fn acquire(&self) -> Result<ConnectionRef>;

    fn release(&self, connection: ConnectionRef);
}

impl<S: ConnectionSource + ?Sized> ConnectionSource for Arc<S> {
    fn acquire(&self) -> Result<ConnectionRef> {
        (**self).acquire()
    }

    fn release(&self, connection: ConnectionRef) {
        (**self).release(connection)
    }
}

/// Capability interface a storage adapter implements to participate in
/// coordinated transactions. Composed explicitly into adapter types; there
/// is no runtime mixin.
pub trait TransactionAware: Send + Sync {
    /// Normalized connection-target identifier. Primitives created for the
    /// same logical target can share a physical connection within one
    /// transaction, so this must be stable.
    fn adapter_id(&self) -> &AdapterId;

    /// Whether the backend can create savepoints. When false, nested
    /// transactions on this adapter degrade to joining the enclosing one
    /// (or fail, under `TxOptions::require_savepoints`); the adapter will
    /// never be asked for a `Nesting::Savepoint` primitive.
    fn supports_savepoints(&self) -> bool {
        false
    }

    /// Produce a fresh transaction primitive for this adapter. Called at
    /// most once per transaction: `Root` acquires a new connection,
    /// `Savepoint` binds to the enclosing transaction's connection.
    fn transaction_primitive(&self, nesting: &Nesting) -> Result<Arc<dyn TransactionPrimitive>>;
}

/// Transaction-aware view over a connection source.
///
/// While a transaction is current for the adapter in the given context,
/// `acquire` hands out that transaction's own connection — the same one on
/// every call — instead of pulling a fresh one from the pool, and `release`
/// refuses to return it to the pool until the transaction finalizes.
///
/// The inner source is shared; the view is cheap and built per execution
/// context, since acquisition is resolved against that context's stacks.
pub struct TransactionalSource<S> {
    adapter_id: AdapterId,
    context: TxContext,
    inner: S,
}

impl<S: ConnectionSource> TransactionalSource<S> {
    pub fn new(adapter_id: AdapterId, context: TxContext, inner: S) -> Self {
        Self {
            adapter_id,
            context,
            inner,
        }
    }

    pub fn adapter_id(&self) -> &AdapterId {
        &self.adapter_id
    }

    /// The wrapped source, for paths that must bypass redirection.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: ConnectionSource> ConnectionSource for TransactionalSource<S> {
    fn acquire(&self) -> Result<ConnectionRef> {
        if let Some(current) = self.context.current_transaction(&self.adapter_id) {
            return Ok(current.primitive.connection());
        }
        self.inner.acquire()
    }

    fn release(&self, connection: ConnectionRef) {
        if let Some(current) = self.context.current_transaction(&self.adapter_id) {
            if same_connection(&connection, &current.primitive.connection()) {
                // stays open until the transaction finalizes
                return;
            }
        }
        self.inner.release(connection)
    }
}
