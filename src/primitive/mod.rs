// ============================================================================
// Transaction Primitive Contract
// ============================================================================
//
// The narrow capability set a backend driver must satisfy to participate in
// coordinated transactions: begin, commit, rollback, close, and a connection
// accessor. Backend-specific locking, isolation levels, and savepoint syntax
// are encapsulated behind these operations; nothing above this layer may
// assume them.
//
// ============================================================================

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::Result;

/// A live backend connection, opaque to the coordinator.
///
/// The coordinator only moves connections around and compares them by
/// identity; issuing statements on one is the query layer's business.
/// Backends downcast through `as_any` to get at their concrete type.
pub trait Connection: Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

/// Shared handle to a backend connection
pub type ConnectionRef = Arc<dyn Connection>;

/// Identity comparison for connection handles.
///
/// Compares the data pointers only. Comparing fat pointers would also
/// compare vtable addresses, which are not unique across codegen units.
pub fn same_connection(a: &ConnectionRef, b: &ConnectionRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// A backend-level transaction handle on a single live connection.
///
/// Exclusively owned by the `Transaction` that created it, one per
/// participating adapter, created lazily on first begin and closed exactly
/// once when the owning transaction finalizes. For a primitive created from
/// `Nesting::Savepoint`, `begin`/`commit`/`rollback` must issue
/// create-savepoint / release-savepoint / rollback-to-savepoint on the
/// connection it was given, and `close` must not close that connection:
/// the root primitive owns it.
pub trait TransactionPrimitive: Send + Sync {
    fn begin(&self) -> Result<()>;

    fn commit(&self) -> Result<()>;

    fn rollback(&self) -> Result<()>;

    /// Release the underlying connection. Idempotent.
    fn close(&self) -> Result<()>;

    /// The connection this primitive operates on. Every call returns the
    /// same connection for the lifetime of the primitive.
    fn connection(&self) -> ConnectionRef;

    /// Whether the handle can still accept operations. Rollback-on-cleanup
    /// skips handles that are no longer open instead of failing.
    fn is_open(&self) -> bool;
}

/// How a primitive is being created: as the outermost transaction on its
/// adapter, or as a savepoint nested inside an already-current one.
#[derive(Clone)]
pub enum Nesting {
    /// Outermost transaction for this adapter; the adapter acquires a fresh
    /// connection for it.
    Root,

    /// Nested inside an active transaction on the same adapter. The
    /// primitive must operate on `connection` — the enclosing transaction's
    /// connection — using the given savepoint name.
    Savepoint {
        name: String,
        depth: usize,
        connection: ConnectionRef,
    },
}

impl Nesting {
    pub fn is_root(&self) -> bool {
        matches!(self, Nesting::Root)
    }

    /// Nesting depth this primitive is created at (0 = outermost)
    pub fn depth(&self) -> usize {
        match self {
            Nesting::Root => 0,
            Nesting::Savepoint { depth, .. } => *depth,
        }
    }
}

/// Degraded nesting for backends without savepoint support.
///
/// Wraps the enclosing transaction's connection and turns
/// begin/commit/rollback into no-ops, so the nested work simply
/// participates in the outer commit or rollback. An approximation: rolling
/// back the nested transaction cannot undo its writes, they stay pending in
/// the enclosing transaction.
pub struct FlattenedPrimitive {
    connection: ConnectionRef,
    open: AtomicBool,
}

impl FlattenedPrimitive {
    pub fn new(connection: ConnectionRef) -> Self {
        Self {
            connection,
            open: AtomicBool::new(true),
        }
    }
}

impl TransactionPrimitive for FlattenedPrimitive {
    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        // the enclosing transaction's primitive owns the connection
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connection(&self) -> ConnectionRef {
        Arc::clone(&self.connection)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
