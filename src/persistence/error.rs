use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    /// The save did not finish within the configured limit. Nothing is known about
    /// whether it committed; the upsert semantics make a retry safe either way.
    #[error("Save timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store closed")]
    StoreClosed,

    #[error("Store dropped response channel")]
    StoreDropped,

    /// The backend rejected the transaction; nothing was written.
    #[error("Transaction rejected: {0}")]
    Rejected(String),
}
