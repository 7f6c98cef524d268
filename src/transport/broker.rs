//! # In-memory broker
//!
//! A single actor task owning every queue, consumer and unacknowledged delivery. Clients
//! talk to it through the cloneable [`Broker`] handle; requests are processed one at a
//! time, so the queue state needs no locks.
//!
//! The broker outlives the connections opened against it, the same way a broker process
//! outlives client sockets. Closing a connection cancels its consumers and requeues
//! their unacknowledged deliveries at the head of the queue.
//!
//! Routing follows the default-exchange model: a message published to `q` lands in `q`,
//! and a dead-letter routing key names the target queue.

use super::acker::Settlement;
use super::error::TransportError;
use super::message::{ConsumeOptions, Delivery, MessageProperties, QueueOptions};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

/// Identifies one consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerTag(pub u64);

type Response<T> = oneshot::Sender<Result<T, TransportError>>;

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub options: QueueOptions,
}

pub(crate) enum BrokerRequest {
    Connect {
        respond_to: Response<(ConnectionId, CancellationToken)>,
    },
    Disconnect {
        connection: ConnectionId,
        respond_to: Response<()>,
    },
    Declare {
        queue: String,
        options: QueueOptions,
        respond_to: Response<()>,
    },
    Publish {
        queue: String,
        payload: Vec<u8>,
        properties: MessageProperties,
        respond_to: Response<()>,
    },
    Consume {
        connection: ConnectionId,
        queue: String,
        options: ConsumeOptions,
        deliveries: mpsc::UnboundedSender<Delivery>,
        respond_to: Response<ConsumerTag>,
    },
    Settle {
        consumer: ConsumerTag,
        delivery_tag: u64,
        settlement: Settlement,
    },
    Expire {
        queue: String,
        sequence: u64,
    },
    SetAvailable {
        available: bool,
    },
    DropConnections {
        respond_to: oneshot::Sender<usize>,
    },
    Stats {
        queue: String,
        respond_to: oneshot::Sender<Option<QueueStats>>,
    },
    Peek {
        queue: String,
        respond_to: oneshot::Sender<Vec<Delivery>>,
    },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    sequence: u64,
    payload: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerTag>,
    next_consumer: usize,
}

struct ConsumerState {
    connection: ConnectionId,
    queue: String,
    options: ConsumeOptions,
    in_flight: usize,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl ConsumerState {
    fn has_capacity(&self) -> bool {
        self.options.prefetch == 0 || self.in_flight < self.options.prefetch
    }
}

struct Unacked {
    consumer: ConsumerTag,
    queue: String,
    message: StoredMessage,
}

/// The server half of the broker. Run it with [`BrokerActor::run`].
pub struct BrokerActor {
    receiver: mpsc::UnboundedReceiver<BrokerRequest>,
    timers: mpsc::WeakUnboundedSender<BrokerRequest>,
    available: bool,
    queues: HashMap<String, QueueState>,
    consumers: HashMap<ConsumerTag, ConsumerState>,
    unacked: BTreeMap<u64, Unacked>,
    connections: HashMap<ConnectionId, CancellationToken>,
    next_id: u64,
}

impl BrokerActor {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Processes requests until every [`Broker`] handle and outstanding acker is gone.
    pub async fn run(mut self) {
        info!("Broker started");
        while let Some(request) = self.receiver.recv().await {
            self.handle(request);
        }
        for token in self.connections.values() {
            token.cancel();
        }
        info!(queues = self.queues.len(), "Broker shutdown");
    }

    fn handle(&mut self, request: BrokerRequest) {
        match request {
            BrokerRequest::Connect { respond_to } => {
                if !self.available {
                    warn!("Connection refused, broker unavailable");
                    let _ = respond_to.send(Err(TransportError::ConnectionRefused(
                        "broker unavailable".to_string(),
                    )));
                    return;
                }
                let id = self.next_id();
                let token = CancellationToken::new();
                self.connections.insert(id, token.clone());
                info!(connection = id, "Connection opened");
                let _ = respond_to.send(Ok((id, token)));
            }
            BrokerRequest::Disconnect {
                connection,
                respond_to,
            } => {
                self.close_connection(connection);
                let _ = respond_to.send(Ok(()));
            }
            BrokerRequest::Declare {
                queue,
                options,
                respond_to,
            } => {
                debug!(%queue, ?options, "Declare");
                self.queues.entry(queue.clone()).or_default().options = options;
                let _ = respond_to.send(Ok(()));
            }
            BrokerRequest::Publish {
                queue,
                payload,
                properties,
                respond_to,
            } => {
                if !self.queues.contains_key(&queue) {
                    debug!(%queue, "Auto-declaring queue on publish");
                    self.queues.insert(queue.clone(), QueueState::default());
                }
                self.enqueue(&queue, payload, properties);
                self.dispatch(&queue);
                let _ = respond_to.send(Ok(()));
            }
            BrokerRequest::Consume {
                connection,
                queue,
                options,
                deliveries,
                respond_to,
            } => {
                let result = self.add_consumer(connection, &queue, options, deliveries);
                if result.is_ok() {
                    self.dispatch(&queue);
                }
                let _ = respond_to.send(result);
            }
            BrokerRequest::Settle {
                consumer,
                delivery_tag,
                settlement,
            } => self.settle(consumer, delivery_tag, settlement),
            BrokerRequest::Expire { queue, sequence } => self.expire(&queue, sequence),
            BrokerRequest::SetAvailable { available } => {
                info!(available, "Broker availability changed");
                self.available = available;
            }
            BrokerRequest::DropConnections { respond_to } => {
                let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
                for id in &ids {
                    self.close_connection(*id);
                }
                let _ = respond_to.send(ids.len());
            }
            BrokerRequest::Stats { queue, respond_to } => {
                let stats = self.queues.get(&queue).map(|state| QueueStats {
                    ready: state.ready.len(),
                    unacked: self.unacked.values().filter(|u| u.queue == queue).count(),
                    consumers: state.consumers.len(),
                    options: state.options.clone(),
                });
                let _ = respond_to.send(stats);
            }
            BrokerRequest::Peek { queue, respond_to } => {
                let messages = self
                    .queues
                    .get(&queue)
                    .map(|state| {
                        state
                            .ready
                            .iter()
                            .map(|m| Delivery {
                                delivery_tag: 0,
                                queue: queue.clone(),
                                payload: m.payload.clone(),
                                properties: m.properties.clone(),
                                redelivered: m.redelivered,
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let _ = respond_to.send(messages);
            }
        }
    }

    fn add_consumer(
        &mut self,
        connection: ConnectionId,
        queue: &str,
        options: ConsumeOptions,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Result<ConsumerTag, TransportError> {
        if !self.connections.contains_key(&connection) {
            return Err(TransportError::NotConnected);
        }
        if !self.queues.contains_key(queue) {
            return Err(TransportError::QueueNotFound(queue.to_string()));
        }
        let tag = ConsumerTag(self.next_id());
        self.consumers.insert(
            tag,
            ConsumerState {
                connection,
                queue: queue.to_string(),
                options,
                in_flight: 0,
                deliveries,
            },
        );
        if let Some(state) = self.queues.get_mut(queue) {
            state.consumers.push(tag);
        }
        info!(%queue, consumer = tag.0, prefetch = options.prefetch, "Consumer registered");
        Ok(tag)
    }

    fn enqueue(&mut self, queue: &str, payload: Vec<u8>, properties: MessageProperties) {
        let sequence = self.next_id();
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        state.ready.push_back(StoredMessage {
            sequence,
            payload,
            properties,
            redelivered: false,
        });
        let ttl = state.options.message_ttl;
        if let Some(ttl) = ttl {
            self.schedule_expiry(queue.to_string(), sequence, ttl);
        }
    }

    fn schedule_expiry(&self, queue: String, sequence: u64, ttl: Duration) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(sender) = timers.upgrade() {
                let _ = sender.send(BrokerRequest::Expire { queue, sequence });
            }
        });
    }

    fn expire(&mut self, queue: &str, sequence: u64) {
        let Some(state) = self.queues.get_mut(queue) else {
            return;
        };
        // Already delivered or settled messages are no longer ready.
        let Some(position) = state.ready.iter().position(|m| m.sequence == sequence) else {
            return;
        };
        if let Some(message) = state.ready.remove(position) {
            debug!(%queue, message_id = %message.properties.message_id, "Message expired");
            self.dead_letter(queue, message);
        }
    }

    fn dead_letter(&mut self, from: &str, message: StoredMessage) {
        let target = self
            .queues
            .get(from)
            .and_then(|state| state.options.dead_letter_target())
            .map(str::to_string);

        match target {
            Some(target) if self.queues.contains_key(&target) => {
                let message_id = &message.properties.message_id;
                debug!(%from, %target, %message_id, "Dead-lettered");
                self.enqueue(&target, message.payload, message.properties);
                self.dispatch(&target);
            }
            Some(target) => {
                let message_id = &message.properties.message_id;
                warn!(%from, %target, %message_id, "Dead-letter target missing, message dropped");
            }
            None => {
                let message_id = &message.properties.message_id;
                warn!(%from, %message_id, "No dead-letter policy, message dropped");
            }
        }
    }

    fn settle(&mut self, consumer: ConsumerTag, delivery_tag: u64, settlement: Settlement) {
        match self.unacked.get(&delivery_tag) {
            Some(unacked) if unacked.consumer == consumer => {}
            _ => {
                debug!(consumer = consumer.0, delivery_tag, "Stale settlement ignored");
                return;
            }
        }
        let Some(Unacked { queue, message, .. }) = self.unacked.remove(&delivery_tag) else {
            return;
        };
        if let Some(state) = self.consumers.get_mut(&consumer) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Nack { requeue: true } => {
                if let Some(state) = self.queues.get_mut(&queue) {
                    state.ready.push_front(StoredMessage {
                        redelivered: true,
                        ..message
                    });
                }
            }
            Settlement::Nack { requeue: false } => self.dead_letter(&queue, message),
        }
        self.dispatch(&queue);
    }

    /// Hands ready messages to consumers with free prefetch slots, round-robin.
    fn dispatch(&mut self, queue: &str) {
        loop {
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.ready.is_empty() || state.consumers.is_empty() {
                return;
            }

            let count = state.consumers.len();
            let chosen = (0..count)
                .map(|offset| (state.next_consumer + offset) % count)
                .find(|&index| {
                    self.consumers
                        .get(&state.consumers[index])
                        .is_some_and(ConsumerState::has_capacity)
                });
            let Some(index) = chosen else {
                return;
            };
            let tag = state.consumers[index];
            state.next_consumer = (index + 1) % count;
            let Some(message) = state.ready.pop_front() else {
                return;
            };

            self.next_id += 1;
            let delivery_tag = self.next_id;
            let delivery = Delivery {
                delivery_tag,
                queue: queue.to_string(),
                payload: message.payload.clone(),
                properties: message.properties.clone(),
                redelivered: message.redelivered,
            };

            let Some(consumer) = self.consumers.get_mut(&tag) else {
                return;
            };
            if consumer.deliveries.send(delivery).is_err() {
                // Consumer task is gone: put the message back and forget the consumer.
                if let Some(state) = self.queues.get_mut(queue) {
                    state.ready.push_front(message);
                }
                self.detach_consumer(tag);
                continue;
            }
            if consumer.options.no_ack {
                continue;
            }
            consumer.in_flight += 1;
            self.unacked.insert(
                delivery_tag,
                Unacked {
                    consumer: tag,
                    queue: queue.to_string(),
                    message,
                },
            );
        }
    }

    /// Removes a consumer and requeues its unacknowledged deliveries in their original order.
    fn detach_consumer(&mut self, tag: ConsumerTag) -> Option<String> {
        let consumer = self.consumers.remove(&tag)?;
        let pending: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == tag)
            .map(|(delivery_tag, _)| *delivery_tag)
            .collect();

        let state = self.queues.get_mut(&consumer.queue)?;
        state.consumers.retain(|t| *t != tag);
        state.next_consumer = 0;
        for delivery_tag in pending.iter().rev() {
            if let Some(unacked) = self.unacked.remove(delivery_tag) {
                state.ready.push_front(StoredMessage {
                    redelivered: true,
                    ..unacked.message
                });
            }
        }
        debug!(consumer = tag.0, requeued = pending.len(), "Consumer detached");
        Some(consumer.queue)
    }

    fn close_connection(&mut self, connection: ConnectionId) {
        if let Some(token) = self.connections.remove(&connection) {
            token.cancel();
            info!(connection, "Connection closed");
        }
        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .filter(|(_, c)| c.connection == connection)
            .map(|(tag, _)| *tag)
            .collect();
        let affected: BTreeSet<String> = tags
            .into_iter()
            .filter_map(|tag| self.detach_consumer(tag))
            .collect();
        for queue in affected {
            self.dispatch(&queue);
        }
    }
}

/// Cloneable handle to a running [`BrokerActor`].
#[derive(Clone)]
pub struct Broker {
    sender: mpsc::UnboundedSender<BrokerRequest>,
}

impl Broker {
    /// Creates the broker actor and its handle. The actor must be run via `.run()`.
    pub fn new() -> (BrokerActor, Broker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let actor = BrokerActor {
            receiver,
            timers: sender.downgrade(),
            available: true,
            queues: HashMap::new(),
            consumers: HashMap::new(),
            unacked: BTreeMap::new(),
            connections: HashMap::new(),
            next_id: 0,
        };
        (actor, Broker { sender })
    }

    /// Creates the broker and spawns its actor on the current runtime.
    pub fn spawn() -> Broker {
        let (actor, broker) = Broker::new();
        tokio::spawn(actor.run());
        broker
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<BrokerRequest> {
        self.sender.clone()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Response<T>) -> BrokerRequest,
    ) -> Result<T, TransportError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .map_err(|_| TransportError::BrokerClosed)?;
        response.await.map_err(|_| TransportError::BrokerDropped)?
    }

    pub async fn connect(&self) -> Result<(ConnectionId, CancellationToken), TransportError> {
        self.request(|respond_to| BrokerRequest::Connect { respond_to })
            .await
    }

    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), TransportError> {
        self.request(|respond_to| BrokerRequest::Disconnect {
            connection,
            respond_to,
        })
        .await
    }

    pub async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.request(|respond_to| BrokerRequest::Declare {
            queue: queue.to_string(),
            options,
            respond_to,
        })
        .await
    }

    pub async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<(), TransportError> {
        self.request(|respond_to| BrokerRequest::Publish {
            queue: queue.to_string(),
            payload,
            properties,
            respond_to,
        })
        .await
    }

    pub(crate) async fn consume(
        &self,
        connection: ConnectionId,
        queue: &str,
        options: ConsumeOptions,
        deliveries: mpsc::UnboundedSender<Delivery>,
    ) -> Result<ConsumerTag, TransportError> {
        self.request(|respond_to| BrokerRequest::Consume {
            connection,
            queue: queue.to_string(),
            options,
            deliveries,
            respond_to,
        })
        .await
    }

    /// Refuses (or accepts again) new connections. Existing ones are unaffected.
    pub fn set_available(&self, available: bool) {
        let _ = self.sender.send(BrokerRequest::SetAvailable { available });
    }

    /// Closes every open connection, as a broker restart would. Returns how many were closed.
    pub async fn drop_connections(&self) -> usize {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(BrokerRequest::DropConnections { respond_to })
            .is_err()
        {
            return 0;
        }
        response.await.unwrap_or(0)
    }

    pub async fn stats(&self, queue: &str) -> Option<QueueStats> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(BrokerRequest::Stats {
                queue: queue.to_string(),
                respond_to,
            })
            .ok()?;
        response.await.ok().flatten()
    }

    /// Ready (not yet delivered) messages of `queue`, head first.
    pub async fn peek(&self, queue: &str) -> Vec<Delivery> {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(BrokerRequest::Peek {
                queue: queue.to_string(),
                respond_to,
            })
            .is_err()
        {
            return Vec::new();
        }
        response.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::message::PublishOptions;

    fn props(id: &str) -> MessageProperties {
        PublishOptions::default().message_id(id).into_properties()
    }

    #[tokio::test]
    async fn test_publish_then_consume_with_prefetch() {
        let broker = Broker::spawn();
        broker.declare("q", QueueOptions::durable()).await.unwrap();
        for i in 0..3 {
            broker.publish("q", vec![i], props(&i.to_string())).await.unwrap();
        }

        let (connection, _token) = broker.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = broker
            .consume(connection, "q", ConsumeOptions::prefetch(2), tx)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.payload, vec![0]);
        assert_eq!(second.payload, vec![1]);
        let stats = broker.stats("q").await.unwrap();
        assert_eq!((stats.ready, stats.unacked), (1, 2));

        broker
            .sender()
            .send(BrokerRequest::Settle {
                consumer,
                delivery_tag: first.delivery_tag,
                settlement: Settlement::Ack,
            })
            .unwrap();
        let third = rx.recv().await.unwrap();
        assert_eq!(third.payload, vec![2]);
    }

    #[tokio::test]
    async fn test_nack_routes_to_dead_letter_queue() {
        let broker = Broker::spawn();
        broker.declare("q.dlq", QueueOptions::durable()).await.unwrap();
        broker
            .declare("q", QueueOptions::durable().dead_letter_to("q.dlq"))
            .await
            .unwrap();
        broker.publish("q", b"x".to_vec(), props("m1")).await.unwrap();

        let (connection, _token) = broker.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = broker
            .consume(connection, "q", ConsumeOptions::default(), tx)
            .await
            .unwrap();
        let delivery = rx.recv().await.unwrap();
        broker
            .sender()
            .send(BrokerRequest::Settle {
                consumer,
                delivery_tag: delivery.delivery_tag,
                settlement: Settlement::Nack { requeue: false },
            })
            .unwrap();

        let dead = broker.peek("q.dlq").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id(), "m1");
        assert_eq!(broker.stats("q").await.unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn test_closed_connection_requeues_unacked() {
        let broker = Broker::spawn();
        broker.declare("q", QueueOptions::durable()).await.unwrap();
        broker.publish("q", b"a".to_vec(), props("a")).await.unwrap();
        broker.publish("q", b"b".to_vec(), props("b")).await.unwrap();

        let (connection, token) = broker.connect().await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker
            .consume(connection, "q", ConsumeOptions::default(), tx)
            .await
            .unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        assert_eq!(broker.drop_connections().await, 1);
        assert!(token.is_cancelled());

        let ready = broker.peek("q").await;
        let ids: Vec<_> = ready.iter().map(|d| d.message_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(ready.iter().all(|d| d.redelivered));
    }

    #[tokio::test]
    async fn test_ttl_expiry_dead_letters_back() {
        let broker = Broker::spawn();
        broker.declare("q", QueueOptions::durable()).await.unwrap();
        broker
            .declare(
                "q.retry",
                QueueOptions::durable()
                    .dead_letter_to("q")
                    .message_ttl(Duration::from_millis(20)),
            )
            .await
            .unwrap();
        broker.publish("q.retry", b"r".to_vec(), props("r")).await.unwrap();
        assert_eq!(broker.stats("q.retry").await.unwrap().ready, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(broker.stats("q.retry").await.unwrap().ready, 0);
        assert_eq!(broker.peek("q").await[0].message_id(), "r");
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        let broker = Broker::spawn();
        broker.set_available(false);
        assert!(matches!(
            broker.connect().await,
            Err(TransportError::ConnectionRefused(_))
        ));
        broker.set_available(true);
        assert!(broker.connect().await.is_ok());
    }
}
