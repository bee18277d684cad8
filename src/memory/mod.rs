// ============================================================================
// Memory Backend
// ============================================================================
//
// Reference implementation of the adapter and primitive contracts: a
// savepoint-capable in-memory record store with a small connection pool.
// Useful on its own for tests and prototyping, and as the template for
// writing a real backend adapter.
//
// ============================================================================

mod pool;
mod primitive;
mod store;

pub use pool::{MemoryPool, MemoryPoolConfig, PoolStats};
pub use primitive::MemoryPrimitive;
pub use store::{MemoryConnection, MemoryStore};

use std::sync::Arc;

use crate::adapter::{TransactionAware, TransactionalSource};
use crate::context::TxContext;
use crate::core::{AdapterId, Result, TxError};
use crate::primitive::{ConnectionRef, Nesting, TransactionPrimitive};

/// Storage adapter over an in-memory record store.
///
/// Savepoint support is on by default; `without_savepoints` produces an
/// adapter whose nested transactions degrade to joining the enclosing one,
/// the way a backend without savepoint support behaves.
pub struct MemoryAdapter {
    id: AdapterId,
    store: MemoryStore,
    pool: Arc<MemoryPool>,
    savepoints: bool,
}

impl MemoryAdapter {
    pub fn new(target: &str) -> Self {
        Self::with_config(target, MemoryPoolConfig::default())
    }

    pub fn with_config(target: &str, config: MemoryPoolConfig) -> Self {
        let id = AdapterId::new(target);
        let store = MemoryStore::new();
        let pool = Arc::new(MemoryPool::new(id.clone(), store.clone(), config));
        Self {
            id,
            store,
            pool,
            savepoints: true,
        }
    }

    /// Disable savepoint support, emulating a backend whose native
    /// transactions are flat.
    pub fn without_savepoints(mut self) -> Self {
        self.savepoints = false;
        self
    }

    /// Committed state of this adapter's target
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Transaction-aware connection source for the given execution context.
    /// This is what the query layer should acquire connections through.
    pub fn source(&self, context: &TxContext) -> TransactionalSource<Arc<MemoryPool>> {
        TransactionalSource::new(self.id.clone(), context.clone(), Arc::clone(&self.pool))
    }

    /// View a coordinator connection as a memory session
    pub fn session<'a>(&self, connection: &'a ConnectionRef) -> Result<&'a MemoryConnection> {
        connection
            .as_any()
            .downcast_ref::<MemoryConnection>()
            .ok_or_else(|| TxError::Backend {
                adapter: self.id.clone(),
                op: "session",
                source: anyhow::anyhow!("connection does not belong to the memory backend"),
            })
    }
}

impl TransactionAware for MemoryAdapter {
    fn adapter_id(&self) -> &AdapterId {
        &self.id
    }

    fn supports_savepoints(&self) -> bool {
        self.savepoints
    }

    fn transaction_primitive(&self, nesting: &Nesting) -> Result<Arc<dyn TransactionPrimitive>> {
        use crate::adapter::ConnectionSource;

        match nesting {
            Nesting::Root => {
                let connection = self.pool.acquire()?;
                Ok(Arc::new(MemoryPrimitive::root(
                    self.id.clone(),
                    connection,
                    Arc::clone(&self.pool),
                )))
            }
            Nesting::Savepoint {
                name, connection, ..
            } => Ok(Arc::new(MemoryPrimitive::savepoint(
                self.id.clone(),
                connection.clone(),
                name.clone(),
            ))),
        }
    }
}
