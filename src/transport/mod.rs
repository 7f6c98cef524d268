//! # Queue transport
//!
//! The queue capability set the ingestion worker depends on:
//! connect, disconnect, publish, consume, queue declaration with dead-letter policy, and
//! the three-queue dead-letter topology.
//!
//! ## Delivery model
//!
//! At-least-once for as long as the broker runs. A delivery leaves its queue only when
//! its [`Acker`] acks it. A nack without requeue, or a handler that drops its `Acker`,
//! routes the message to the queue's dead-letter target. Unacknowledged deliveries of a
//! lost connection are requeued and redelivered later, never twice while still unacked.
//!
//! ## Implementations
//!
//! - [`InMemoryTransport`] over the [`Broker`] actor, with a supervised reconnect loop.
//!   The broker is a task in this process: it outlives connections but not the process,
//!   so queue contents are gone after exit or a crash. `durable` and `persistent` are
//!   accepted and reported but not acted on.
//! - [`RecordingTransport`](crate::mock::RecordingTransport) for tests.

pub mod acker;
pub mod backoff;
pub mod broker;
pub mod error;
pub mod memory;
pub mod message;

pub use acker::*;
pub use backoff::Backoff;
pub use broker::{Broker, BrokerActor, ConsumerTag, QueueStats};
pub use error::*;
pub use memory::*;
pub use message::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Processes deliveries for one consumer.
///
/// Deliveries of one consumer are handled sequentially: the next one is only taken once
/// `handle` returns. The handler must settle the `Acker` exactly once; returning an
/// error after dropping it unsettled rejects the delivery.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery, acker: Acker) -> Result<(), BoxError>;
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Opens a session. Loss of that session later triggers background reconnects.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Closes the session and its consumers. Unacked deliveries return to their queues.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Starts a consumer task feeding `handler`.
    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<(), TransportError>;

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Declares `<queue><suffix>`, `<queue>.retry` and redeclares `<queue>` so that
    /// rejections land in the dead-letter queue. See [`dead_letter_topology`].
    async fn setup_dead_letter_queue(
        &self,
        queue: &str,
        suffix: &str,
    ) -> Result<(), TransportError>;
}

/// Names of the queues around one base queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub dead_letter: String,
    pub retry: String,
}

impl QueueNames {
    pub fn new(base: &str, dlq_suffix: &str) -> Self {
        Self {
            main: base.to_string(),
            dead_letter: format!("{}{}", base, dlq_suffix),
            retry: format!("{}.retry", base),
        }
    }
}

/// Declarations, in order, for the dead-letter topology of `queue`:
///
/// 1. the dead-letter queue, a plain durable sink;
/// 2. the retry queue, dead-lettering back into `queue` after `retry_delay`;
/// 3. `queue` itself, dead-lettering into the dead-letter queue.
pub fn dead_letter_topology(
    queue: &str,
    suffix: &str,
    retry_delay: Duration,
) -> Vec<(String, QueueOptions)> {
    let names = QueueNames::new(queue, suffix);
    vec![
        (names.dead_letter.clone(), QueueOptions::durable()),
        (
            names.retry,
            QueueOptions::durable()
                .dead_letter_to(queue)
                .message_ttl(retry_delay),
        ),
        (
            names.main,
            QueueOptions::durable().dead_letter_to(names.dead_letter),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_wires_retry_back_to_main() {
        let topology = dead_letter_topology("user-orders", ".dlq", Duration::from_secs(30));
        let names: Vec<_> = topology.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["user-orders.dlq", "user-orders.retry", "user-orders"]);

        let retry = &topology[1].1;
        assert_eq!(retry.dead_letter_target(), Some("user-orders"));
        assert_eq!(retry.message_ttl, Some(Duration::from_secs(30)));
        assert_eq!(topology[2].1.dead_letter_target(), Some("user-orders.dlq"));
        assert_eq!(topology[0].1.dead_letter_target(), None);
    }
}
