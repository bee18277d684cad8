use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global transaction ID counter
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a logical transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl TxId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TxId(NEXT_TX_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Normalized connection-target identifier for a storage adapter.
///
/// Primitive handles and transaction stacks are keyed by this identifier,
/// so the same logical target must always normalize to the same value:
/// surrounding whitespace and a single trailing `/` are stripped, and the
/// scheme part (everything before `://`) is lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterId(String);

impl AdapterId {
    pub fn new(target: impl AsRef<str>) -> Self {
        let raw = target.as_ref().trim();
        let raw = raw.strip_suffix('/').unwrap_or(raw);

        let normalized = match raw.split_once("://") {
            Some((scheme, rest)) => format!("{}://{}", scheme.to_ascii_lowercase(), rest),
            None => raw.to_string(),
        };

        AdapterId(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AdapterId {
    fn from(target: &str) -> Self {
        Self::new(target)
    }
}
