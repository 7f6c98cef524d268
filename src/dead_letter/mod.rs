//! # Dead-letter retries
//!
//! [`DeadLetterRetryCoordinator`] consumes `<queue>.dlq`. Each delivery carries its
//! attempt count in the `x-retry-count` header (absent = 0):
//!
//! - `count >= max_retries`: acknowledged and dropped for good.
//! - otherwise the aggregate is saved directly. Success acks the delivery; failure
//!   republishes the original payload with `count + 1` and a fresh timestamp to the
//!   configured [`RetryRoute`] target, then acks.
//!
//! The counter travels with the message, so it survives broker restarts and does not
//! depend on the broker's own redelivery bookkeeping. A payload that cannot be decoded
//! counts as a failed attempt like any other.

use crate::config::{RetryConfig, RetryRoute};
use crate::persistence::{save_all_within, PersistenceGateway};
use crate::transport::{
    Acker, BoxError, Delivery, DeliveryHandler, PublishOptions, QueueNames, QueueTransport,
};
use crate::worker::{decode_user, WorkerError};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// What happened to one dead-lettered delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Persisted,
    Discarded { retry_count: u32 },
    Republished { queue: String, retry_count: u32 },
    /// Republishing failed; the delivery went back to the dead-letter queue as is.
    Requeued,
}

pub struct DeadLetterRetryCoordinator {
    transport: Arc<dyn QueueTransport>,
    gateway: Arc<dyn PersistenceGateway>,
    names: QueueNames,
    config: RetryConfig,
    save_timeout: Duration,
}

impl DeadLetterRetryCoordinator {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        gateway: Arc<dyn PersistenceGateway>,
        names: QueueNames,
        config: RetryConfig,
        save_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            gateway,
            names,
            config,
            save_timeout,
        }
    }

    fn retry_target(&self) -> &str {
        match self.config.route {
            RetryRoute::DeadLetterQueue => &self.names.dead_letter,
            RetryRoute::DelayQueue => &self.names.retry,
        }
    }

    async fn persist(&self, payload: &[u8]) -> Result<(), WorkerError> {
        let user = decode_user(payload)?;
        save_all_within(self.gateway.as_ref(), &[user], self.save_timeout).await?;
        Ok(())
    }

    /// Processes one delivery and settles its `acker`.
    pub async fn process(&self, delivery: Delivery, acker: Acker) -> RetryOutcome {
        let message_id = delivery.message_id().to_string();
        let retry_count = delivery.retry_count();
        info!(%message_id, retry_count, "Reprocessing failed order from DLQ");

        if retry_count >= self.config.max_retries {
            warn!(
                %message_id,
                retry_count,
                max_retries = self.config.max_retries,
                "Retries exhausted, discarding message"
            );
            acker.ack();
            return RetryOutcome::Discarded { retry_count };
        }

        let error = match self.persist(&delivery.payload).await {
            Ok(()) => {
                acker.ack();
                info!(%message_id, "Successfully reprocessed order from DLQ");
                return RetryOutcome::Persisted;
            }
            Err(e) => e,
        };

        let next = retry_count + 1;
        let queue = self.retry_target().to_string();
        warn!(
            %message_id,
            retry_count = next,
            %queue,
            error = %error,
            "Reprocessing failed, scheduling retry"
        );

        let mut options = PublishOptions::default()
            .message_id(message_id.clone())
            .timestamp(Utc::now());
        options.persistent = delivery.properties.persistent;
        options.headers = delivery.properties.headers.clone();
        let options = options.retry_count(next);

        match self.transport.publish(&queue, delivery.payload, options).await {
            Ok(()) => {
                acker.ack();
                RetryOutcome::Republished {
                    queue,
                    retry_count: next,
                }
            }
            Err(e) => {
                error!(%message_id, error = %e, "Failed to republish, requeueing");
                acker.nack(true);
                RetryOutcome::Requeued
            }
        }
    }
}

#[async_trait]
impl DeliveryHandler for DeadLetterRetryCoordinator {
    async fn handle(&self, delivery: Delivery, acker: Acker) -> Result<(), BoxError> {
        self.process(delivery, acker).await;
        Ok(())
    }
}
