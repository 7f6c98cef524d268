//! Error types for the queue transport.

use thiserror::Error;

/// Errors raised by [`QueueTransport`](super::QueueTransport) operations.
///
/// Connection-level failures are recovered in the background by the reconnect loop;
/// the call that observed them still fails and the caller decides what to do.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// No session is open (never connected, disconnected, or reconnecting).
    #[error("Transport not connected")]
    NotConnected,

    /// The broker refused or could not accept the connection.
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The broker task has stopped and no longer answers requests.
    #[error("Broker unavailable")]
    BrokerClosed,

    /// The broker dropped the response channel before answering.
    #[error("Broker dropped response channel")]
    BrokerDropped,

    /// Consuming requires the queue to exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Payload could not be serialized for publishing.
    #[error("Failed to encode payload: {0}")]
    Encode(String),
}
