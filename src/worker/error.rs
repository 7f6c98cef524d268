use super::MessageFormatError;
use crate::persistence::PersistenceError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Format(#[from] MessageFormatError),

    #[error("Worker already started")]
    AlreadyStarted,

    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}
