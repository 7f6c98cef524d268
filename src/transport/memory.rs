//! [`QueueTransport`] over the in-memory [`Broker`].
//!
//! ## Reconnection
//!
//! Each successful [`connect`](QueueTransport::connect) spawns one supervisor task. It
//! waits for the session's close signal and, unless the close was requested through
//! [`disconnect`](QueueTransport::disconnect), reconnects with capped exponential backoff
//! on the tokio (monotonic) clock, forever, then re-registers every consumer. The loop
//! is iterative, so a long outage does not grow the stack or chain timers.
//!
//! Calls made while the session is down fail with [`TransportError::NotConnected`].

use super::broker::{Broker, ConnectionId, ConsumerTag};
use super::{
    dead_letter_topology, Acker, Backoff, ConsumeOptions, Delivery, DeliveryHandler,
    PublishOptions, QueueOptions, QueueTransport, TransportError,
};
use crate::lock;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection and reconnection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// TTL of the `.retry` queue declared by `setup_dead_letter_queue`.
    pub retry_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(5),
            reconnect_max_delay: Duration::from_secs(60),
            retry_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Clone)]
struct Session {
    connection: ConnectionId,
    closed: CancellationToken,
}

#[derive(Clone)]
struct Registration {
    queue: String,
    handler: Arc<dyn DeliveryHandler>,
    options: ConsumeOptions,
}

struct Inner {
    broker: Broker,
    config: TransportConfig,
    session: Mutex<Option<Session>>,
    registrations: Mutex<Vec<Registration>>,
    /// Bumped on every explicit connect/disconnect; stale supervisors exit on mismatch.
    generation: AtomicU64,
    reconnects: AtomicU64,
}

/// Cloneable transport handle; clones share one session.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<Inner>,
}

impl InMemoryTransport {
    pub fn new(broker: Broker, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                broker,
                config,
                session: Mutex::new(None),
                registrations: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                reconnects: AtomicU64::new(0),
            }),
        }
    }

    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Number of successful background reconnects so far.
    pub fn reconnect_count(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn session(&self) -> Result<Session, TransportError> {
        lock(&self.session)
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    async fn establish(&self) -> Result<CancellationToken, TransportError> {
        let (connection, closed) = self.broker.connect().await?;
        *lock(&self.session) = Some(Session {
            connection,
            closed: closed.clone(),
        });
        Ok(closed)
    }

    async fn start_consumer(&self, registration: &Registration) -> Result<(), TransportError> {
        let session = self.session()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = self
            .broker
            .consume(
                session.connection,
                &registration.queue,
                registration.options,
                sender,
            )
            .await?;
        tokio::spawn(run_consumer(
            self.broker.clone(),
            registration.clone(),
            tag,
            receiver,
            session.closed,
        ));
        Ok(())
    }

    async fn supervise(self: Arc<Self>, generation: u64, mut closed: CancellationToken) {
        loop {
            closed.cancelled().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            *lock(&self.session) = None;
            warn!("Connection lost, reconnecting in background");

            let mut backoff = Backoff::new(
                self.config.reconnect_base_delay,
                self.config.reconnect_max_delay,
            );
            closed = loop {
                let delay = backoff.next_delay();
                tokio::time::sleep(delay).await;
                if self.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                match self.establish().await {
                    Ok(token) => break token,
                    Err(e) => warn!(
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconnect failed"
                    ),
                }
            };

            let registrations = lock(&self.registrations).clone();
            for registration in &registrations {
                if let Err(e) = self.start_consumer(registration).await {
                    error!(queue = %registration.queue, error = %e, "Failed to restore consumer");
                }
            }
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            info!(
                attempts = backoff.attempts(),
                consumers = registrations.len(),
                "Reconnected"
            );
        }
    }
}

async fn run_consumer(
    broker: Broker,
    registration: Registration,
    tag: ConsumerTag,
    mut receiver: mpsc::UnboundedReceiver<Delivery>,
    closed: CancellationToken,
) {
    let queue = registration.queue;
    let sender = broker.sender();
    loop {
        let delivery = tokio::select! {
            _ = closed.cancelled() => break,
            delivery = receiver.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let acker = if registration.options.no_ack {
            Acker::auto()
        } else {
            Acker::broker(sender.clone(), tag, delivery.delivery_tag)
        };
        let message_id = delivery.message_id().to_string();
        if let Err(e) = registration.handler.handle(delivery, acker).await {
            error!(%queue, %message_id, error = %e, "Error processing message");
        }
    }
    debug!(%queue, consumer = tag.0, "Consumer stopped");
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = self.inner.establish().await.map_err(|e| {
            error!(error = %e, "Failed to connect");
            e
        })?;
        tokio::spawn(Arc::clone(&self.inner).supervise(generation, closed));
        info!("Connected to broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.registrations).clear();
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            self.inner
                .broker
                .disconnect(session.connection)
                .await
                .map_err(|e| {
                    error!(error = %e, "Error disconnecting");
                    e
                })?;
            info!("Disconnected from broker");
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.inner.session()?;
        self.inner
            .broker
            .publish(queue, payload, options.into_properties())
            .await
            .map_err(|e| {
                error!(%queue, error = %e, "Error publishing message");
                e
            })
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> Result<(), TransportError> {
        let registration = Registration {
            queue: queue.to_string(),
            handler,
            options,
        };
        self.inner.start_consumer(&registration).await?;
        lock(&self.inner.registrations).push(registration);
        info!(%queue, prefetch = options.prefetch, "Consumer started");
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        self.inner.session()?;
        self.inner.broker.declare(queue, options).await
    }

    async fn setup_dead_letter_queue(
        &self,
        queue: &str,
        suffix: &str,
    ) -> Result<(), TransportError> {
        for (name, options) in dead_letter_topology(queue, suffix, self.inner.config.retry_delay) {
            self.assert_queue(&name, options).await.map_err(|e| {
                error!(%queue, error = %e, "Error setting up dead letter queue");
                e
            })?;
        }
        info!(%queue, "Dead letter queue setup complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BoxError;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DeliveryHandler for Counting {
        async fn handle(&self, _delivery: Delivery, acker: Acker) -> Result<(), BoxError> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            acker.ack();
            Ok(())
        }
    }

    fn fast_config() -> TransportConfig {
        TransportConfig {
            reconnect_base_delay: Duration::from_millis(10),
            reconnect_max_delay: Duration::from_millis(40),
            retry_delay: Duration::from_millis(50),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_calls_fail_when_not_connected() {
        let transport = InMemoryTransport::new(Broker::spawn(), fast_config());
        let result = transport
            .publish("q", b"{}".to_vec(), PublishOptions::default())
            .await;
        assert_eq!(result, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn test_reconnects_and_restores_consumers() {
        let broker = Broker::spawn();
        let transport = InMemoryTransport::new(broker.clone(), fast_config());
        transport.connect().await.unwrap();
        transport.assert_queue("q", QueueOptions::durable()).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        transport
            .consume("q", Arc::new(Counting { seen: seen.clone() }), ConsumeOptions::prefetch(5))
            .await
            .unwrap();

        broker.set_available(false);
        assert_eq!(broker.drop_connections().await, 1);
        assert!(eventually(|| !transport.is_connected()).await);

        // Stays down while the broker refuses connections.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!transport.is_connected());

        broker.set_available(true);
        assert!(eventually(|| transport.reconnect_count() == 1).await);
        assert!(transport.is_connected());

        transport
            .publish("q", b"{}".to_vec(), PublishOptions::default())
            .await
            .unwrap();
        assert!(eventually(|| seen.load(Ordering::SeqCst) == 1).await);
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let broker = Broker::spawn();
        let transport = InMemoryTransport::new(broker, fast_config());
        transport.connect().await.unwrap();
        transport.disconnect().await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!transport.is_connected());
        assert_eq!(transport.reconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_acker_dead_letters() {
        struct Dropping;

        #[async_trait]
        impl DeliveryHandler for Dropping {
            async fn handle(&self, _delivery: Delivery, _acker: Acker) -> Result<(), BoxError> {
                Err("boom".into())
            }
        }

        let broker = Broker::spawn();
        let transport = InMemoryTransport::new(broker.clone(), fast_config());
        transport.connect().await.unwrap();
        transport.setup_dead_letter_queue("q", ".dlq").await.unwrap();
        transport
            .consume("q", Arc::new(Dropping), ConsumeOptions::default())
            .await
            .unwrap();
        transport
            .publish("q", b"{}".to_vec(), PublishOptions::default().message_id("m"))
            .await
            .unwrap();

        let mut dead = Vec::new();
        for _ in 0..100 {
            dead = broker.peek("q.dlq").await;
            if !dead.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id(), "m");
    }
}
