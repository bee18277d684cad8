use thiserror::Error;

use crate::core::types::AdapterId;
use crate::transaction::TxState;

#[derive(Debug, Error)]
pub enum TxError {
    /// Operation is not legal in the transaction's current state, e.g.
    /// `begin` called twice or `commit` before `begin`. The transaction's
    /// state is left unchanged.
    #[error("cannot {op} transaction in state {state}")]
    InvalidState { op: &'static str, state: TxState },

    /// `pop_transaction` was called for an adapter with no current
    /// transaction in this execution context. Indicates an unbalanced
    /// begin/commit/rollback sequence.
    #[error("transaction stack for adapter '{0}' is empty")]
    EmptyStack(AdapterId),

    /// A single underlying connection operation failed.
    #[error("adapter '{adapter}' failed during {op}: {source}")]
    Backend {
        adapter: AdapterId,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Commit or rollback was attempted on every participant; one or more
    /// of them failed. The per-adapter failures are collected here so the
    /// caller can see which participants succeeded and which did not.
    #[error("{op} failed on {} of {attempted} adapter(s): {}", .failures.len(), failure_display(.failures))]
    PartialFailure {
        op: &'static str,
        attempted: usize,
        failures: Vec<(AdapterId, anyhow::Error)>,
    },

    /// A nested transaction required savepoint isolation but the backend
    /// has no savepoint support. Only raised under
    /// `TxOptions::require_savepoints`; otherwise nesting degrades to
    /// joining the enclosing transaction.
    #[error("adapter '{0}' does not support savepoints")]
    UnsupportedNesting(AdapterId),
}

pub type Result<T> = std::result::Result<T, TxError>;

fn failure_display(failures: &[(AdapterId, anyhow::Error)]) -> String {
    failures
        .iter()
        .map(|(adapter, err)| format!("{adapter} ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl TxError {
    /// State-machine and stack violations are programmer errors: they must
    /// surface immediately and are never worth retrying.
    pub fn is_programmer_error(&self) -> bool {
        matches!(self, TxError::InvalidState { .. } | TxError::EmptyStack(_))
    }

    /// The per-adapter failure list of a `PartialFailure`, if that is what
    /// this error is.
    pub fn partial_failures(&self) -> Option<&[(AdapterId, anyhow::Error)]> {
        match self {
            TxError::PartialFailure { failures, .. } => Some(failures),
            _ => None,
        }
    }
}
