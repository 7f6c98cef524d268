//! Settlement handle for a single delivery.
//!
//! Every delivery comes with exactly one [`Acker`]. Calling [`Acker::ack`] or
//! [`Acker::nack`] consumes it, so a delivery cannot be settled twice. An `Acker` that is
//! dropped unsettled (an error path or a panic in the handler) rejects the delivery
//! without requeue, which routes it to the queue's dead-letter target.

use super::broker::{BrokerRequest, ConsumerTag};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Nack { requeue: bool },
}

enum Target {
    Broker {
        sender: mpsc::UnboundedSender<BrokerRequest>,
        consumer: ConsumerTag,
        delivery_tag: u64,
    },
    Probe(Option<oneshot::Sender<Settlement>>),
    /// `no_ack` consumers: the broker already settled the delivery.
    Auto,
}

pub struct Acker {
    target: Target,
    settled: bool,
}

impl std::fmt::Debug for Acker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acker").field("settled", &self.settled).finish()
    }
}

impl Acker {
    pub(crate) fn broker(
        sender: mpsc::UnboundedSender<BrokerRequest>,
        consumer: ConsumerTag,
        delivery_tag: u64,
    ) -> Self {
        Self {
            target: Target::Broker {
                sender,
                consumer,
                delivery_tag,
            },
            settled: false,
        }
    }

    pub(crate) fn auto() -> Self {
        Self {
            target: Target::Auto,
            settled: true,
        }
    }

    /// Creates an acker detached from any broker plus a probe observing its settlement.
    pub fn probe() -> (Self, AckProbe) {
        let (tx, rx) = oneshot::channel();
        let acker = Self {
            target: Target::Probe(Some(tx)),
            settled: false,
        };
        (acker, AckProbe { receiver: rx })
    }

    /// Removes the delivery from its queue.
    pub fn ack(mut self) {
        self.settle(Settlement::Ack);
    }

    /// Rejects the delivery. With `requeue = false` it is dead-lettered (or dropped if the
    /// queue has no dead-letter target).
    pub fn nack(mut self, requeue: bool) {
        self.settle(Settlement::Nack { requeue });
    }

    /// Gives up on settling. The broker returns the delivery to its queue once the
    /// consumer's connection closes.
    pub fn release(mut self) {
        self.settled = true;
    }

    fn settle(&mut self, settlement: Settlement) {
        if self.settled {
            return;
        }
        self.settled = true;
        match &mut self.target {
            Target::Broker {
                sender,
                consumer,
                delivery_tag,
            } => {
                // A closed broker already requeued the delivery with the connection.
                let _ = sender.send(BrokerRequest::Settle {
                    consumer: *consumer,
                    delivery_tag: *delivery_tag,
                    settlement,
                });
            }
            Target::Probe(sender) => {
                if let Some(sender) = sender.take() {
                    let _ = sender.send(settlement);
                }
            }
            Target::Auto => {}
        }
    }
}

impl Drop for Acker {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Delivery dropped without settlement, rejecting");
            self.settle(Settlement::Nack { requeue: false });
        }
    }
}

/// Observes how a probe [`Acker`] was settled.
#[derive(Debug)]
pub struct AckProbe {
    receiver: oneshot::Receiver<Settlement>,
}

impl AckProbe {
    /// Returns the settlement if it already happened.
    pub fn try_settlement(&mut self) -> Option<Settlement> {
        self.receiver.try_recv().ok()
    }

    /// Waits for the settlement. `None` only if the acker was leaked.
    pub async fn settlement(self) -> Option<Settlement> {
        self.receiver.await.ok()
    }
}
