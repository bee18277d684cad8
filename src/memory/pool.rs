use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::adapter::ConnectionSource;
use crate::core::{AdapterId, Result, TxError};
use crate::memory::store::{MemoryConnection, MemoryStore};
use crate::primitive::ConnectionRef;

/// Memory pool configuration
#[derive(Debug, Clone)]
pub struct MemoryPoolConfig {
    /// Maximum number of connections; 0 means unbounded
    pub max_connections: usize,
}

impl MemoryPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }
}

impl Default for MemoryPoolConfig {
    fn default() -> Self {
        Self { max_connections: 8 }
    }
}

/// Connection pool for a memory target.
///
/// The plain, transaction-unaware connection source: wrap it in a
/// `TransactionalSource` (see `MemoryAdapter::source`) to get
/// transaction-aware acquisition.
pub struct MemoryPool {
    adapter_id: AdapterId,
    store: MemoryStore,
    config: MemoryPoolConfig,
    idle: Mutex<VecDeque<ConnectionRef>>,
    total: AtomicUsize,
    next_id: AtomicU64,
}

impl MemoryPool {
    pub(crate) fn new(adapter_id: AdapterId, store: MemoryStore, config: MemoryPoolConfig) -> Self {
        Self {
            adapter_id,
            store,
            config,
            idle: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().len();
        let total = self.total.load(Ordering::SeqCst);
        PoolStats {
            total_connections: total,
            idle_connections: idle,
            active_connections: total.saturating_sub(idle),
            max_connections: self.config.max_connections,
        }
    }
}

impl ConnectionSource for MemoryPool {
    fn acquire(&self) -> Result<ConnectionRef> {
        if let Some(connection) = self.idle.lock().pop_front() {
            return Ok(connection);
        }

        let total = self.total.load(Ordering::SeqCst);
        if self.config.max_connections > 0 && total >= self.config.max_connections {
            return Err(TxError::Backend {
                adapter: self.adapter_id.clone(),
                op: "acquire",
                source: anyhow::anyhow!(
                    "connection pool exhausted ({total} of {} in use)",
                    self.config.max_connections
                ),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection::new(id, self.store.clone())))
    }

    fn release(&self, connection: ConnectionRef) {
        let Some(session) = connection.as_any().downcast_ref::<MemoryConnection>() else {
            warn!(adapter = %self.adapter_id, "released connection does not belong to this pool");
            return;
        };

        if session.in_transaction() {
            // cannot be reused with a transaction pending; dropping it
            // discards the uncommitted buffer
            warn!(
                adapter = %self.adapter_id,
                connection = session.id(),
                "connection released with an open transaction; discarding"
            );
            self.total.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        self.idle.lock().push_back(connection);
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    pub max_connections: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} active, {} idle, max {}",
            self.active_connections,
            self.total_connections,
            self.idle_connections,
            self.max_connections
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool(max: usize) -> MemoryPool {
        MemoryPool::new(
            AdapterId::new("memory://pool"),
            MemoryStore::new(),
            MemoryPoolConfig::new().max_connections(max),
        )
    }

    #[test]
    fn test_acquire_release_round_trip() {
        let pool = pool(2);

        let conn = pool.acquire().unwrap();
        assert_eq!(pool.stats().active_connections, 1);

        pool.release(conn);
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.idle_connections, 1);
    }

    #[test]
    fn test_idle_connections_are_reused() {
        let pool = pool(2);

        let first = pool.acquire().unwrap();
        let first_id = first
            .as_any()
            .downcast_ref::<MemoryConnection>()
            .unwrap()
            .id();
        pool.release(first);

        let second = pool.acquire().unwrap();
        let second_id = second
            .as_any()
            .downcast_ref::<MemoryConnection>()
            .unwrap()
            .id();
        assert_eq!(first_id, second_id);
    }

    #[test]
    fn test_exhausted_pool_fails() {
        let pool = pool(1);

        let _held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, TxError::Backend { op: "acquire", .. }));
    }

    #[test]
    fn test_unbounded_pool() {
        let pool = pool(0);
        let _a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert_eq!(pool.stats().total_connections, 2);
    }

    #[test]
    fn test_in_transaction_connection_is_discarded() {
        let pool = pool(2);

        let conn = pool.acquire().unwrap();
        let session = conn.as_any().downcast_ref::<MemoryConnection>().unwrap();
        session.begin_tx().unwrap();
        session.put("k", json!(1));

        pool.release(conn);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert_eq!(stats.total_connections, 0);
    }
}
