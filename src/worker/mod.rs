//! # Batch ingestion worker
//!
//! Consumes aggregates from the main queue, buffers them and writes them to the
//! [`PersistenceGateway`] in batches, one transaction per batch.
//!
//! ## Flushing
//!
//! A flush is triggered when the buffer reaches `batch_size`, by the periodic timer when
//! the buffer is non-empty, and once more on shutdown. At most one flush runs at a time:
//! the size and timer triggers skip if one is already running, shutdown waits for it.
//! A flush swaps the whole buffer out before saving, so deliveries arriving during the
//! save accumulate in a fresh buffer and a failed batch is never re-added.
//!
//! ## Acknowledgement
//!
//! See [`AckMode`]. With [`AckMode::OnBuffer`] a failing size-triggered flush nacks the
//! delivery that triggered it so that one at least reaches the dead-letter queue; the
//! rest of that batch was already acknowledged and is reported in the logs.

pub mod error;
pub mod message;
pub mod publisher;

pub use error::*;
pub use message::*;
pub use publisher::*;

use crate::config::{AckMode, AppConfig, RetryConfig, WorkerConfig};
use crate::dead_letter::DeadLetterRetryCoordinator;
use crate::lock;
use crate::model::User;
use crate::persistence::{save_all_within, PersistenceGateway};
use crate::transport::{
    Acker, BoxError, ConsumeOptions, Delivery, DeliveryHandler, QueueNames, QueueTransport,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Pending {
    user: User,
    /// Held only in [`AckMode::AfterFlush`].
    acker: Option<Acker>,
}

#[derive(Default)]
struct Buffer {
    pending: Vec<Pending>,
    /// Set on shutdown; later deliveries are parked instead of buffered.
    closed: bool,
    parked: Vec<Acker>,
}

struct WorkerShared {
    gateway: Arc<dyn PersistenceGateway>,
    config: WorkerConfig,
    buffer: Mutex<Buffer>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl WorkerShared {
    async fn accept(&self, message_id: &str, user: User, acker: Acker) {
        let buffered = {
            let mut buffer = lock(&self.buffer);
            if buffer.closed {
                buffer.parked.push(acker);
                None
            } else {
                let (held, immediate) = match self.config.ack_mode {
                    AckMode::OnBuffer => (None, Some(acker)),
                    AckMode::AfterFlush => (Some(acker), None),
                };
                buffer.pending.push(Pending { user, acker: held });
                Some((buffer.pending.len(), immediate))
            }
        };
        let Some((buffer_size, acker)) = buffered else {
            debug!(%message_id, "Worker closing, leaving delivery for redelivery");
            return;
        };
        debug!(%message_id, buffer_size, "Added message to buffer");

        if buffer_size >= self.config.batch_size {
            if let Err(e) = self.try_flush().await {
                error!(%message_id, error = %e, "Size-triggered flush failed");
                if let Some(acker) = acker {
                    acker.nack(false);
                }
                return;
            }
        }
        if let Some(acker) = acker {
            acker.ack();
        }
    }

    fn buffered_len(&self) -> usize {
        lock(&self.buffer).pending.len()
    }

    /// Flushes unless another flush holds the lock; returns 0 in that case.
    async fn try_flush(&self) -> Result<usize, WorkerError> {
        let Ok(_guard) = self.flush_lock.try_lock() else {
            debug!("Flush already in progress, skipping");
            return Ok(0);
        };
        self.flush_locked().await
    }

    /// Waits for any running flush, then flushes.
    async fn flush_all(&self) -> Result<usize, WorkerError> {
        let _guard = self.flush_lock.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<usize, WorkerError> {
        let batch = std::mem::take(&mut lock(&self.buffer).pending);
        if batch.is_empty() {
            return Ok(0);
        }
        let (users, ackers): (Vec<User>, Vec<Option<Acker>>) =
            batch.into_iter().map(|p| (p.user, p.acker)).unzip();
        let count = users.len();
        info!(count, "Persisting batch in a single transaction");

        match save_all_within(self.gateway.as_ref(), &users, self.config.flush_timeout).await {
            Ok(()) => {
                for acker in ackers.into_iter().flatten() {
                    acker.ack();
                }
                info!(count, "Batch persisted");
                Ok(count)
            }
            Err(e) => {
                let held = ackers.iter().filter(|a| a.is_some()).count();
                for acker in ackers.into_iter().flatten() {
                    acker.nack(false);
                }
                error!(count, rejected = held, error = %e, "Batch persist failed");
                Err(e.into())
            }
        }
    }

    async fn run_flush_timer(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.batch_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pending = self.buffered_len();
                    if pending == 0 {
                        continue;
                    }
                    info!(pending, "Processing partial batch");
                    if let Err(e) = self.try_flush().await {
                        error!(error = %e, "Timed flush failed");
                    }
                }
            }
        }
        debug!("Flush timer stopped");
    }
}

struct MainQueueHandler {
    shared: Arc<WorkerShared>,
}

#[async_trait]
impl DeliveryHandler for MainQueueHandler {
    async fn handle(&self, delivery: Delivery, acker: Acker) -> Result<(), BoxError> {
        let message_id = delivery.message_id().to_string();
        match decode_user(&delivery.payload) {
            Ok(user) => self.shared.accept(&message_id, user, acker).await,
            Err(e) => {
                warn!(%message_id, error = %e, "Rejecting malformed message");
                acker.nack(false);
            }
        }
        Ok(())
    }
}

/// Owns the main-queue consumer, the dead-letter consumer and the flush timer.
pub struct BatchIngestionWorker {
    transport: Arc<dyn QueueTransport>,
    shared: Arc<WorkerShared>,
    coordinator: Arc<DeadLetterRetryCoordinator>,
    names: QueueNames,
    dlq_suffix: String,
    retry: RetryConfig,
    started: AtomicBool,
    timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BatchIngestionWorker {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        gateway: Arc<dyn PersistenceGateway>,
        config: &AppConfig,
    ) -> Self {
        let names = QueueNames::new(&config.queue.name, &config.queue.dlq_suffix);
        let coordinator = Arc::new(DeadLetterRetryCoordinator::new(
            transport.clone(),
            gateway.clone(),
            names.clone(),
            config.retry.clone(),
            config.worker.flush_timeout,
        ));
        Self {
            transport,
            shared: Arc::new(WorkerShared {
                gateway,
                config: config.worker.clone(),
                buffer: Mutex::new(Buffer::default()),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            coordinator,
            names,
            dlq_suffix: config.queue.dlq_suffix.clone(),
            retry: config.retry.clone(),
            started: AtomicBool::new(false),
            timer: Mutex::new(None),
        }
    }

    pub fn queue_names(&self) -> &QueueNames {
        &self.names
    }

    /// Connects, declares the queue topology, starts both consumers and the flush timer.
    pub async fn start(&self) -> Result<(), WorkerError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyStarted);
        }
        // A previous shutdown closed the buffer.
        let parked = {
            let mut buffer = lock(&self.shared.buffer);
            buffer.closed = false;
            std::mem::take(&mut buffer.parked)
        };
        for acker in parked {
            acker.release();
        }
        if let Err(e) = self.start_consumers().await {
            error!(error = %e, "Failed to initialize order processing worker");
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.shared.clone().run_flush_timer(cancel.clone()));
        *lock(&self.timer) = Some((cancel, handle));

        info!(
            queue = %self.names.main,
            batch_size = self.shared.config.batch_size,
            ack_mode = ?self.shared.config.ack_mode,
            "Order processing worker initialized"
        );
        Ok(())
    }

    async fn start_consumers(&self) -> Result<(), WorkerError> {
        self.transport.connect().await?;
        self.transport
            .setup_dead_letter_queue(&self.names.main, &self.dlq_suffix)
            .await?;
        self.transport
            .consume(
                &self.names.main,
                Arc::new(MainQueueHandler {
                    shared: self.shared.clone(),
                }),
                ConsumeOptions::prefetch(self.shared.config.prefetch_count),
            )
            .await?;
        self.transport
            .consume(
                &self.names.dead_letter,
                self.coordinator.clone(),
                ConsumeOptions::prefetch(self.retry.dlq_prefetch),
            )
            .await?;
        Ok(())
    }

    /// Flushes now unless a flush is already running. Returns the number persisted.
    pub async fn flush(&self) -> Result<usize, WorkerError> {
        self.shared.try_flush().await
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.buffered_len()
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.flush_lock.try_lock().is_err()
    }

    /// Stops the timer, drains one final flush and disconnects.
    ///
    /// Deliveries arriving after shutdown began are left unacknowledged and return to
    /// their queue when the connection closes. Both the flush and the disconnect are
    /// attempted; the first failure is returned. The worker can be started again
    /// afterwards.
    pub async fn shutdown(&self) -> Result<usize, WorkerError> {
        let timer = lock(&self.timer).take();
        if let Some((cancel, handle)) = timer {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Flush timer task failed");
            }
        }
        lock(&self.shared.buffer).closed = true;

        let remaining = self.buffered_len();
        if remaining > 0 {
            info!(remaining, "Processing remaining messages before shutdown");
        }
        let flushed = self.shared.flush_all().await;
        let disconnected = self.transport.disconnect().await;

        let parked = std::mem::take(&mut lock(&self.shared.buffer).parked);
        for acker in parked {
            acker.release();
        }
        self.started.store(false, Ordering::SeqCst);

        let count = flushed.map_err(|e| {
            error!(error = %e, "Final flush failed");
            e
        })?;
        disconnected.map_err(|e| {
            error!(error = %e, "Error shutting down order processing worker");
            WorkerError::from(e)
        })?;
        info!(flushed = count, "Order processing worker shut down");
        Ok(count)
    }
}
