pub mod error;
pub mod types;

pub use error::{Result, TxError};
pub use types::{AdapterId, TxId};
