use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::adapter::ConnectionSource;
use crate::core::{AdapterId, Result, TxError};
use crate::memory::pool::MemoryPool;
use crate::memory::store::MemoryConnection;
use crate::primitive::{ConnectionRef, TransactionPrimitive};

enum Mode {
    /// Owns a pooled connection; close returns it to the pool
    Root,
    /// Operates through the named savepoint on a borrowed connection
    Savepoint(String),
}

/// Transaction primitive of the memory backend
pub struct MemoryPrimitive {
    adapter_id: AdapterId,
    connection: ConnectionRef,
    mode: Mode,
    pool: Option<Arc<MemoryPool>>,
    open: AtomicBool,
}

impl MemoryPrimitive {
    pub(crate) fn root(
        adapter_id: AdapterId,
        connection: ConnectionRef,
        pool: Arc<MemoryPool>,
    ) -> Self {
        Self {
            adapter_id,
            connection,
            mode: Mode::Root,
            pool: Some(pool),
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn savepoint(adapter_id: AdapterId, connection: ConnectionRef, name: String) -> Self {
        Self {
            adapter_id,
            connection,
            mode: Mode::Savepoint(name),
            pool: None,
            open: AtomicBool::new(true),
        }
    }

    fn apply<F>(&self, op: &'static str, call: F) -> Result<()>
    where
        F: FnOnce(&MemoryConnection) -> anyhow::Result<()>,
    {
        let session = self
            .connection
            .as_any()
            .downcast_ref::<MemoryConnection>()
            .ok_or_else(|| TxError::Backend {
                adapter: self.adapter_id.clone(),
                op,
                source: anyhow::anyhow!("connection does not belong to the memory backend"),
            })?;
        call(session).map_err(|source| TxError::Backend {
            adapter: self.adapter_id.clone(),
            op,
            source,
        })
    }
}

impl TransactionPrimitive for MemoryPrimitive {
    fn begin(&self) -> Result<()> {
        self.apply("begin", |session| match &self.mode {
            Mode::Root => session.begin_tx(),
            Mode::Savepoint(name) => session.savepoint(name),
        })
    }

    fn commit(&self) -> Result<()> {
        self.apply("commit", |session| match &self.mode {
            Mode::Root => session.commit_tx(),
            Mode::Savepoint(name) => session.release_savepoint(name),
        })
    }

    fn rollback(&self) -> Result<()> {
        self.apply("rollback", |session| match &self.mode {
            Mode::Root => session.rollback_tx(),
            Mode::Savepoint(name) => session.rollback_to_savepoint(name),
        })
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            // a savepoint primitive borrows the root's connection and has
            // nothing to release
            if let (Mode::Root, Some(pool)) = (&self.mode, &self.pool) {
                pool.release(Arc::clone(&self.connection));
            }
        }
        Ok(())
    }

    fn connection(&self) -> ConnectionRef {
        Arc::clone(&self.connection)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ConnectionSource;
    use crate::memory::pool::MemoryPoolConfig;
    use crate::memory::store::MemoryStore;
    use serde_json::json;

    fn fixture() -> (MemoryStore, Arc<MemoryPool>) {
        let store = MemoryStore::new();
        let pool = Arc::new(MemoryPool::new(
            AdapterId::new("memory://primitive"),
            store.clone(),
            MemoryPoolConfig::default(),
        ));
        (store, pool)
    }

    fn session(connection: &ConnectionRef) -> &MemoryConnection {
        connection
            .as_any()
            .downcast_ref::<MemoryConnection>()
            .unwrap()
    }

    #[test]
    fn test_root_primitive_lifecycle() {
        let (store, pool) = fixture();
        let connection = pool.acquire().unwrap();
        let primitive =
            MemoryPrimitive::root(AdapterId::new("memory://primitive"), connection, pool.clone());

        primitive.begin().unwrap();
        session(&primitive.connection()).put("k", json!(1));
        primitive.commit().unwrap();
        assert_eq!(store.get("k"), Some(json!(1)));

        primitive.close().unwrap();
        assert!(!primitive.is_open());
        // connection went back to the pool
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[test]
    fn test_savepoint_primitive_does_not_release_connection() {
        let (_store, pool) = fixture();
        let connection = pool.acquire().unwrap();
        let root = MemoryPrimitive::root(
            AdapterId::new("memory://primitive"),
            connection.clone(),
            pool.clone(),
        );
        root.begin().unwrap();

        let nested = MemoryPrimitive::savepoint(
            AdapterId::new("memory://primitive"),
            connection.clone(),
            "sp_1_1".to_string(),
        );
        nested.begin().unwrap();
        session(&connection).put("k", json!(1));
        nested.rollback().unwrap();
        nested.close().unwrap();

        // root still owns a live transaction on the connection
        assert!(session(&connection).in_transaction());
        assert_eq!(pool.stats().idle_connections, 0);

        root.rollback().unwrap();
        root.close().unwrap();
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[test]
    fn test_close_releases_once() {
        let (_store, pool) = fixture();
        let connection = pool.acquire().unwrap();
        let primitive =
            MemoryPrimitive::root(AdapterId::new("memory://primitive"), connection, pool.clone());

        primitive.begin().unwrap();
        primitive.rollback().unwrap();
        primitive.close().unwrap();
        primitive.close().unwrap();
        assert_eq!(pool.stats().idle_connections, 1);
    }
}
