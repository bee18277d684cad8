// ============================================================================
// Transaction State
// ============================================================================

use serde::{Deserialize, Serialize};

/// Transaction lifecycle state
///
/// State transitions:
/// ```text
/// None ──begin──> Begin ──commit────────────> Commit
///                   │
///                   ├──rollback─────────────> Rollback
///                   │
///                   └──rollback (savepoint)─> RollbackSavepoint
/// ```
///
/// `RollbackSavepoint` is the terminal state of a nested transaction that
/// was rolled back: the backend call was a rollback-to-savepoint rather
/// than a full rollback, but the transaction is finished either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxState {
    /// Created but not yet begun
    None,

    /// Begun and accepting work
    Begin,

    /// Successfully committed (or savepoint released)
    Commit,

    /// Rolled back in full
    Rollback,

    /// Rolled back to the savepoint that opened this nested transaction
    RollbackSavepoint,
}

impl TxState {
    /// Check if the transaction is currently accepting work
    pub fn is_open(&self) -> bool {
        matches!(self, TxState::Begin)
    }

    /// Check if the transaction reached a terminal state
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            TxState::Commit | TxState::Rollback | TxState::RollbackSavepoint
        )
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxState::None => write!(f, "NONE"),
            TxState::Begin => write!(f, "BEGIN"),
            TxState::Commit => write!(f, "COMMIT"),
            TxState::Rollback => write!(f, "ROLLBACK"),
            TxState::RollbackSavepoint => write!(f, "ROLLBACK_SAVEPOINT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(!TxState::None.is_open());
        assert!(TxState::Begin.is_open());
        assert!(!TxState::Commit.is_open());

        assert!(!TxState::None.is_finalized());
        assert!(!TxState::Begin.is_finalized());
        assert!(TxState::Commit.is_finalized());
        assert!(TxState::Rollback.is_finalized());
        assert!(TxState::RollbackSavepoint.is_finalized());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(TxState::Begin.to_string(), "BEGIN");
        assert_eq!(TxState::RollbackSavepoint.to_string(), "ROLLBACK_SAVEPOINT");
    }
}
