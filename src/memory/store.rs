// ============================================================================
// In-Memory Record Store
// ============================================================================
//
// Committed state lives in a shared map. Each connection layers an
// uncommitted op log over it while a backend transaction is active, so a
// transaction reads its own writes while other connections keep seeing
// committed state only. Savepoints are watermarks into the op log.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::primitive::Connection;

/// Shared committed state of one memory target
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed value for a key
    pub fn get(&self, key: &str) -> Option<Value> {
        self.records.read().get(key).cloned()
    }

    /// Number of committed records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Committed keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.records.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn snapshot(&self) -> HashMap<String, Value> {
        self.records.read().clone()
    }

    fn apply(&self, ops: &[Op]) {
        let mut records = self.records.write();
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    records.insert(key.clone(), value.clone());
                }
                Op::Delete(key) => {
                    records.remove(key);
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Put(String, Value),
    Delete(String),
}

#[derive(Default)]
struct TxBuffer {
    ops: Vec<Op>,
    /// (name, op-log watermark) pairs, innermost last
    savepoints: Vec<(String, usize)>,
}

/// A live connection to a memory target.
///
/// Writes go straight to the store until a backend transaction is begun on
/// the connection; from then on they buffer in the connection's op log and
/// reads merge the log over committed state.
pub struct MemoryConnection {
    id: u64,
    store: MemoryStore,
    tx: Mutex<Option<TxBuffer>>,
}

impl MemoryConnection {
    pub(crate) fn new(id: u64, store: MemoryStore) -> Self {
        Self {
            id,
            store,
            tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.tx.lock().is_some()
    }

    pub fn put(&self, key: &str, value: Value) {
        let mut tx = self.tx.lock();
        match tx.as_mut() {
            Some(buffer) => buffer.ops.push(Op::Put(key.to_string(), value)),
            None => self.store.apply(&[Op::Put(key.to_string(), value)]),
        }
    }

    pub fn delete(&self, key: &str) {
        let mut tx = self.tx.lock();
        match tx.as_mut() {
            Some(buffer) => buffer.ops.push(Op::Delete(key.to_string())),
            None => self.store.apply(&[Op::Delete(key.to_string())]),
        }
    }

    /// Value for a key as this connection sees it: committed state with the
    /// connection's own uncommitted writes applied over it.
    pub fn get(&self, key: &str) -> Option<Value> {
        let tx = self.tx.lock();
        let mut value = self.store.get(key);
        if let Some(buffer) = tx.as_ref() {
            for op in &buffer.ops {
                match op {
                    Op::Put(k, v) if k == key => value = Some(v.clone()),
                    Op::Delete(k) if k == key => value = None,
                    _ => {}
                }
            }
        }
        value
    }

    /// Number of records as this connection sees them
    pub fn len(&self) -> usize {
        self.view().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys as this connection sees them, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.view().into_keys().collect();
        keys.sort();
        keys
    }

    fn view(&self) -> HashMap<String, Value> {
        let tx = self.tx.lock();
        let mut view = self.store.snapshot();
        if let Some(buffer) = tx.as_ref() {
            for op in &buffer.ops {
                match op {
                    Op::Put(key, value) => {
                        view.insert(key.clone(), value.clone());
                    }
                    Op::Delete(key) => {
                        view.remove(key);
                    }
                }
            }
        }
        view
    }

    pub(crate) fn begin_tx(&self) -> anyhow::Result<()> {
        let mut tx = self.tx.lock();
        if tx.is_some() {
            bail!("transaction already begun on connection {}", self.id);
        }
        *tx = Some(TxBuffer::default());
        Ok(())
    }

    pub(crate) fn commit_tx(&self) -> anyhow::Result<()> {
        let buffer = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("no transaction begun on connection {}", self.id))?;
        self.store.apply(&buffer.ops);
        Ok(())
    }

    pub(crate) fn rollback_tx(&self) -> anyhow::Result<()> {
        self.tx
            .lock()
            .take()
            .ok_or_else(|| anyhow::anyhow!("no transaction begun on connection {}", self.id))?;
        Ok(())
    }

    pub(crate) fn savepoint(&self, name: &str) -> anyhow::Result<()> {
        let mut tx = self.tx.lock();
        let Some(buffer) = tx.as_mut() else {
            bail!("savepoint '{name}' requires a transaction on connection {}", self.id);
        };
        let watermark = buffer.ops.len();
        buffer.savepoints.push((name.to_string(), watermark));
        Ok(())
    }

    /// Drop the savepoint (and any opened after it), keeping the writes
    /// made since; they now belong to the enclosing transaction.
    pub(crate) fn release_savepoint(&self, name: &str) -> anyhow::Result<()> {
        let mut tx = self.tx.lock();
        let Some(buffer) = tx.as_mut() else {
            bail!("no transaction begun on connection {}", self.id);
        };
        let index = Self::find_savepoint(buffer, name)?;
        buffer.savepoints.truncate(index);
        Ok(())
    }

    /// Discard every write made since the savepoint was created. The
    /// savepoint itself remains; savepoints opened after it are dropped.
    pub(crate) fn rollback_to_savepoint(&self, name: &str) -> anyhow::Result<()> {
        let mut tx = self.tx.lock();
        let Some(buffer) = tx.as_mut() else {
            bail!("no transaction begun on connection {}", self.id);
        };
        let index = Self::find_savepoint(buffer, name)?;
        let watermark = buffer.savepoints[index].1;
        buffer.ops.truncate(watermark);
        buffer.savepoints.truncate(index + 1);
        Ok(())
    }

    fn find_savepoint(buffer: &TxBuffer, name: &str) -> anyhow::Result<usize> {
        buffer
            .savepoints
            .iter()
            .rposition(|(candidate, _)| candidate == name)
            .ok_or_else(|| anyhow::anyhow!("unknown savepoint '{name}'"))
    }
}

impl Connection for MemoryConnection {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
