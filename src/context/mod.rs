// ============================================================================
// Execution-Context Transaction Stacks
// ============================================================================
//
// Each execution context (thread, worker, task) owns one TxContext. The
// context keeps a LIFO stack of active transactions per adapter; the top of
// a stack is that adapter's "current" transaction, and the adapter shim
// consults it to decide which connection to hand out.
//
// Contexts are never shared between workers, so stacks need no cross-context
// coordination. A transaction must not be used from two contexts at once.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{AdapterId, Result, TxError, TxId};
use crate::primitive::TransactionPrimitive;

/// One adapter's view of a live transaction: its identity, the nesting
/// depth it was opened at (0 = outermost), and the primitive holding its
/// connection.
#[derive(Clone)]
pub struct ActiveTransaction {
    pub id: TxId,
    pub depth: usize,
    pub primitive: Arc<dyn TransactionPrimitive>,
}

/// Per-execution-context registry of transaction stacks, keyed by adapter.
///
/// Cheap to clone; clones share the same stacks. Create one per execution
/// context and thread it through adapter calls explicitly — there is no
/// ambient thread-keyed lookup.
#[derive(Clone, Default)]
pub struct TxContext {
    inner: Arc<ContextInner>,
}

#[derive(Default)]
struct ContextInner {
    stacks: Mutex<HashMap<AdapterId, Vec<ActiveTransaction>>>,
}

impl TxContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a transaction onto the given adapter's stack, making it the
    /// current transaction for that adapter in this context.
    pub fn push_transaction(&self, adapter: &AdapterId, transaction: ActiveTransaction) {
        let mut stacks = self.inner.stacks.lock();
        stacks.entry(adapter.clone()).or_default().push(transaction);
    }

    /// Remove and return the current transaction for the given adapter.
    ///
    /// Popping an empty stack fails with `EmptyStack`: push and pop are
    /// strictly paired, an empty pop means begin/commit/rollback got
    /// unbalanced somewhere.
    pub fn pop_transaction(&self, adapter: &AdapterId) -> Result<ActiveTransaction> {
        let mut stacks = self.inner.stacks.lock();
        stacks
            .get_mut(adapter)
            .and_then(|stack| stack.pop())
            .ok_or_else(|| TxError::EmptyStack(adapter.clone()))
    }

    /// The current transaction for the given adapter, if any. No side
    /// effects.
    pub fn current_transaction(&self, adapter: &AdapterId) -> Option<ActiveTransaction> {
        let stacks = self.inner.stacks.lock();
        stacks.get(adapter).and_then(|stack| stack.last()).cloned()
    }

    /// Number of active transactions stacked for the given adapter.
    pub fn depth(&self, adapter: &AdapterId) -> usize {
        let stacks = self.inner.stacks.lock();
        stacks.get(adapter).map(|stack| stack.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitive::{Connection, ConnectionRef, FlattenedPrimitive};
    use std::any::Any;

    struct FakeConnection;

    impl Connection for FakeConnection {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn record(depth: usize) -> ActiveTransaction {
        let conn: ConnectionRef = Arc::new(FakeConnection);
        ActiveTransaction {
            id: TxId::new(),
            depth,
            primitive: Arc::new(FlattenedPrimitive::new(conn)),
        }
    }

    #[test]
    fn test_push_pop_pairing() {
        let context = TxContext::new();
        let adapter = AdapterId::new("memory://primary");

        let first = record(0);
        let second = record(1);
        let first_id = first.id;
        let second_id = second.id;

        context.push_transaction(&adapter, first);
        context.push_transaction(&adapter, second);
        assert_eq!(context.depth(&adapter), 2);

        assert_eq!(context.pop_transaction(&adapter).unwrap().id, second_id);
        assert_eq!(context.pop_transaction(&adapter).unwrap().id, first_id);
        assert_eq!(context.depth(&adapter), 0);
    }

    #[test]
    fn test_pop_empty_stack_fails() {
        let context = TxContext::new();
        let adapter = AdapterId::new("memory://primary");

        let err = context.pop_transaction(&adapter).unwrap_err();
        assert!(matches!(err, TxError::EmptyStack(_)));
        assert!(err.is_programmer_error());
    }

    #[test]
    fn test_current_transaction_is_top_of_stack() {
        let context = TxContext::new();
        let adapter = AdapterId::new("memory://primary");

        assert!(context.current_transaction(&adapter).is_none());

        let outer = record(0);
        let outer_id = outer.id;
        context.push_transaction(&adapter, outer);
        assert_eq!(context.current_transaction(&adapter).unwrap().id, outer_id);

        let inner = record(1);
        let inner_id = inner.id;
        context.push_transaction(&adapter, inner);
        assert_eq!(context.current_transaction(&adapter).unwrap().id, inner_id);

        // current is pure: asking twice changes nothing
        assert_eq!(context.current_transaction(&adapter).unwrap().id, inner_id);
        assert_eq!(context.depth(&adapter), 2);
    }

    #[test]
    fn test_stacks_are_per_adapter() {
        let context = TxContext::new();
        let primary = AdapterId::new("memory://primary");
        let replica = AdapterId::new("memory://replica");

        context.push_transaction(&primary, record(0));
        assert_eq!(context.depth(&primary), 1);
        assert_eq!(context.depth(&replica), 0);
        assert!(context.current_transaction(&replica).is_none());
    }
}
