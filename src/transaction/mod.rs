// ============================================================================
// Transaction Coordination
// ============================================================================
//
// The Transaction state machine: coordinates one primitive handle per
// participating adapter through begin/commit/rollback, turns nested begins
// into savepoints where the backend supports them, and keeps each adapter's
// execution-context stack in step with the transaction's lifecycle.
//
// ============================================================================

pub mod state;

pub use state::TxState;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::adapter::TransactionAware;
use crate::context::{ActiveTransaction, TxContext};
use crate::core::{AdapterId, Result, TxError, TxId};
use crate::primitive::{FlattenedPrimitive, Nesting, TransactionPrimitive};

/// Behavior options for a transaction
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    require_savepoints: bool,
}

impl TxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require strict savepoint isolation for nested transactions. A nested
    /// begin on a backend without savepoint support then fails with
    /// `UnsupportedNesting` instead of degrading to joining the enclosing
    /// transaction.
    pub fn require_savepoints(mut self, required: bool) -> Self {
        self.require_savepoints = required;
        self
    }

    pub fn savepoints_required(&self) -> bool {
        self.require_savepoints
    }
}

/// Diagnostic snapshot of a transaction
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub id: TxId,
    pub state: TxState,
    pub savepoint: bool,
    pub adapters: Vec<AdapterId>,
    pub age: Duration,
}

/// A logical transaction spanning one or more storage adapters.
///
/// Coordinates a lazily-created primitive handle per participant through
/// the `None → Begin → {Commit | Rollback | RollbackSavepoint}` lifecycle.
/// Beginning while another transaction is already current on a
/// participating adapter (in the same execution context) makes this
/// transaction a savepoint of that one.
///
/// Commit and rollback walk the participants in the order they were
/// declared. The ordering is deterministic but not atomic: a failure on one
/// participant does not undo another's already-completed commit.
///
/// A transaction belongs to the execution context it was created in and
/// must not be shared across contexts.
pub struct Transaction {
    id: TxId,
    state: TxState,
    options: TxOptions,
    context: TxContext,
    participants: Vec<Arc<dyn TransactionAware>>,
    primitives: HashMap<AdapterId, Arc<dyn TransactionPrimitive>>,
    closed: HashSet<AdapterId>,
    savepoint: bool,
    started_at: Instant,
}

impl Transaction {
    /// Create a transaction over the given adapters, in participation
    /// order. Duplicate adapter ids are ignored; the first declaration
    /// wins.
    pub fn new(context: TxContext, participants: Vec<Arc<dyn TransactionAware>>) -> Self {
        let mut transaction = Self {
            id: TxId::new(),
            state: TxState::None,
            options: TxOptions::default(),
            context,
            participants: Vec::new(),
            primitives: HashMap::new(),
            closed: HashSet::new(),
            savepoint: false,
            started_at: Instant::now(),
        };
        for adapter in participants {
            transaction.push_participant(adapter);
        }
        transaction
    }

    pub fn with_options(mut self, options: TxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// Whether this transaction begun as a savepoint of an enclosing one
    pub fn is_savepoint(&self) -> bool {
        self.savepoint
    }

    pub fn context(&self) -> &TxContext {
        &self.context
    }

    /// Participating adapter ids, in declaration order
    pub fn adapters(&self) -> Vec<&AdapterId> {
        self.participants.iter().map(|a| a.adapter_id()).collect()
    }

    /// The primitive handle created for the given adapter, once begun
    pub fn primitive_for(&self, adapter: &AdapterId) -> Option<Arc<dyn TransactionPrimitive>> {
        self.primitives.get(adapter).cloned()
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.id,
            state: self.state,
            savepoint: self.savepoint,
            adapters: self.adapters().into_iter().cloned().collect(),
            age: self.started_at.elapsed(),
        }
    }

    /// Add another adapter to the participant set. Only legal before
    /// `begin`.
    pub fn link(&mut self, adapter: Arc<dyn TransactionAware>) -> Result<()> {
        if self.state != TxState::None {
            return Err(TxError::InvalidState {
                op: "link an adapter to",
                state: self.state,
            });
        }
        self.push_participant(adapter);
        Ok(())
    }

    fn push_participant(&mut self, adapter: Arc<dyn TransactionAware>) {
        let already_linked = self
            .participants
            .iter()
            .any(|a| a.adapter_id() == adapter.adapter_id());
        if !already_linked {
            self.participants.push(adapter);
        }
    }

    /// Begin the transaction.
    ///
    /// For each participant in declaration order: create its primitive
    /// handle (a savepoint-flavored one when a transaction is already
    /// current for that adapter in this context), issue the backend begin,
    /// and push this transaction onto the adapter's stack. If any
    /// participant fails, the ones already begun are rolled back and
    /// released before the error is returned, and the state stays `None`.
    pub fn begin(&mut self) -> Result<()> {
        if self.state != TxState::None {
            return Err(TxError::InvalidState {
                op: "begin",
                state: self.state,
            });
        }

        let participants = self.participants.clone();
        let mut begun: Vec<AdapterId> = Vec::new();

        for adapter in &participants {
            match self.begin_adapter(adapter) {
                Ok(()) => begun.push(adapter.adapter_id().clone()),
                Err(err) => {
                    self.unwind_partial_begin(&begun);
                    return Err(err);
                }
            }
        }

        self.state = TxState::Begin;
        debug!(
            id = %self.id,
            adapters = begun.len(),
            savepoint = self.savepoint,
            "transaction begun"
        );
        Ok(())
    }

    fn begin_adapter(&mut self, adapter: &Arc<dyn TransactionAware>) -> Result<()> {
        let adapter_id = adapter.adapter_id().clone();
        let enclosing = self.context.current_transaction(&adapter_id);
        let depth = enclosing.as_ref().map(|e| e.depth + 1).unwrap_or(0);

        let primitive: Arc<dyn TransactionPrimitive> = match &enclosing {
            None => adapter.transaction_primitive(&Nesting::Root)?,
            Some(outer) => {
                self.savepoint = true;
                if adapter.supports_savepoints() {
                    let nesting = Nesting::Savepoint {
                        name: format!("sp_{}_{}", self.id.as_u64(), depth),
                        depth,
                        connection: outer.primitive.connection(),
                    };
                    adapter.transaction_primitive(&nesting)?
                } else if self.options.savepoints_required() {
                    return Err(TxError::UnsupportedNesting(adapter_id));
                } else {
                    warn!(
                        adapter = %adapter_id,
                        "backend lacks savepoints; nested transaction joins the enclosing one"
                    );
                    Arc::new(FlattenedPrimitive::new(outer.primitive.connection()))
                }
            }
        };

        if let Err(err) = primitive.begin() {
            if let Err(close_err) = primitive.close() {
                warn!(adapter = %adapter_id, error = %close_err, "failed to release primitive after failed begin");
            }
            return Err(err);
        }

        self.primitives.insert(adapter_id.clone(), primitive.clone());
        self.context.push_transaction(
            &adapter_id,
            ActiveTransaction {
                id: self.id,
                depth,
                primitive,
            },
        );
        Ok(())
    }

    /// Undo the parts of a begin that succeeded before one participant
    /// failed, in reverse order.
    fn unwind_partial_begin(&mut self, begun: &[AdapterId]) {
        for adapter_id in begun.iter().rev() {
            if let Err(err) = self.context.pop_transaction(adapter_id) {
                warn!(adapter = %adapter_id, error = %err, "stack already empty while unwinding failed begin");
            }
            if let Some(primitive) = self.primitives.remove(adapter_id) {
                if let Err(err) = primitive.rollback() {
                    warn!(adapter = %adapter_id, error = %err, "rollback failed while unwinding failed begin");
                }
                if let Err(err) = primitive.close() {
                    warn!(adapter = %adapter_id, error = %err, "close failed while unwinding failed begin");
                }
            }
        }
        self.savepoint = false;
    }

    /// Commit the transaction.
    ///
    /// Issues commit (savepoint release, for a savepoint transaction) on
    /// every participant in declaration order. A failing participant does
    /// not stop the remaining ones from being attempted; the collected
    /// failures are surfaced as `PartialFailure` after all attempts. The
    /// state transitions to `Commit` either way — the error, not the state,
    /// records which participants failed.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TxState::Begin {
            return Err(TxError::InvalidState {
                op: "commit",
                state: self.state,
            });
        }

        let failures = self.each_primitive("commit", |p| p.commit(), false);
        self.detach_from_stacks();
        self.close_primitives();
        self.state = TxState::Commit;
        debug!(id = %self.id, "transaction committed");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TxError::PartialFailure {
                op: "commit",
                attempted: self.participants.len(),
                failures,
            })
        }
    }

    /// Roll the transaction back.
    ///
    /// Issues rollback (rollback-to-savepoint, for a savepoint transaction)
    /// on every participant in declaration order, best-effort: primitives
    /// whose handle is no longer open are skipped with a warning, and a
    /// failing participant does not stop the remaining ones. Transitions to
    /// `RollbackSavepoint` when this transaction begun as a savepoint,
    /// `Rollback` otherwise.
    pub fn rollback(&mut self) -> Result<()> {
        if self.state != TxState::Begin {
            return Err(TxError::InvalidState {
                op: "rollback",
                state: self.state,
            });
        }

        let failures = self.each_primitive("rollback", |p| p.rollback(), true);
        self.detach_from_stacks();
        self.close_primitives();
        self.state = if self.savepoint {
            TxState::RollbackSavepoint
        } else {
            TxState::Rollback
        };
        debug!(id = %self.id, state = %self.state, "transaction rolled back");

        if failures.is_empty() {
            Ok(())
        } else {
            Err(TxError::PartialFailure {
                op: "rollback",
                attempted: self.participants.len(),
                failures,
            })
        }
    }

    /// Release every primitive handle regardless of state. Idempotent; the
    /// guaranteed-cleanup path. Release failures are logged, not raised.
    pub fn close(&mut self) -> Result<()> {
        self.close_primitives();
        Ok(())
    }

    /// Run a block within this transaction.
    ///
    /// Begins, executes `block`, and commits when the block returns `Ok` —
    /// including an early `return Ok(..)`; an early successful exit is a
    /// success, not a rollback. When the block returns `Err`, rolls back
    /// (to the savepoint, if nested) and propagates the block's original
    /// error; a failure inside the rollback itself is logged, never allowed
    /// to mask the original error.
    pub fn run<T, E, F>(&mut self, block: F) -> std::result::Result<T, E>
    where
        E: From<TxError>,
        F: FnOnce(&mut Transaction) -> std::result::Result<T, E>,
    {
        self.begin()?;
        match block(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!(
                        id = %self.id,
                        error = %rollback_err,
                        "rollback after failed block reported errors"
                    );
                }
                Err(err)
            }
        }
    }

    /// Apply `op` to every begun primitive in participant order, collecting
    /// per-adapter failures instead of short-circuiting.
    fn each_primitive<F>(
        &self,
        op: &'static str,
        apply: F,
        skip_closed: bool,
    ) -> Vec<(AdapterId, anyhow::Error)>
    where
        F: Fn(&dyn TransactionPrimitive) -> Result<()>,
    {
        let mut failures = Vec::new();
        for adapter in &self.participants {
            let adapter_id = adapter.adapter_id();
            let Some(primitive) = self.primitives.get(adapter_id) else {
                continue;
            };
            if skip_closed && !primitive.is_open() {
                warn!(adapter = %adapter_id, op, "skipping primitive that is no longer open");
                continue;
            }
            if let Err(err) = apply(primitive.as_ref()) {
                failures.push((adapter_id.clone(), anyhow::Error::new(err)));
            }
        }
        failures
    }

    /// Pop this transaction off every participating adapter's stack.
    fn detach_from_stacks(&self) {
        for adapter in &self.participants {
            let adapter_id = adapter.adapter_id();
            if !self.primitives.contains_key(adapter_id) {
                continue;
            }
            match self.context.pop_transaction(adapter_id) {
                Ok(popped) => {
                    if popped.id != self.id {
                        warn!(
                            adapter = %adapter_id,
                            expected = %self.id,
                            found = %popped.id,
                            "popped transaction is not the one being finalized"
                        );
                    }
                }
                Err(err) => {
                    warn!(adapter = %adapter_id, error = %err, "stack already empty while finalizing");
                }
            }
        }
    }

    fn close_primitives(&mut self) {
        for adapter in &self.participants {
            let adapter_id = adapter.adapter_id();
            let Some(primitive) = self.primitives.get(adapter_id) else {
                continue;
            };
            if self.closed.contains(adapter_id) {
                continue;
            }
            if let Err(err) = primitive.close() {
                warn!(adapter = %adapter_id, error = %err, "failed to release transaction primitive");
            }
            self.closed.insert(adapter_id.clone());
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Begin {
            warn!(id = %self.id, "transaction dropped while active; rolling back");
            if let Err(err) = self.rollback() {
                warn!(id = %self.id, error = %err, "rollback during drop reported errors");
            }
        }
        self.close_primitives();
    }
}
