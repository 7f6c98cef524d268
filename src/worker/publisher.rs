use super::{encode_user, WorkerError};
use crate::model::User;
use crate::transport::{PublishOptions, QueueTransport};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Publishes aggregates to the main queue, one message per user.
#[derive(Clone)]
pub struct OrderPublisher {
    transport: Arc<dyn QueueTransport>,
    queue: String,
}

impl OrderPublisher {
    pub fn new(transport: Arc<dyn QueueTransport>, queue: impl Into<String>) -> Self {
        Self {
            transport,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn publish_user(&self, user: &User) -> Result<(), WorkerError> {
        let payload = encode_user(user)?;
        let now = Utc::now();
        let message_id = format!("order-{}-{}", user.id, now.timestamp_millis());
        debug!(%message_id, user_id = %user.id, "Publishing aggregate");
        self.transport
            .publish(
                &self.queue,
                payload,
                PublishOptions::default()
                    .message_id(message_id)
                    .timestamp(now),
            )
            .await?;
        Ok(())
    }

    /// Publishes in order and stops at the first failure. Returns how many were sent.
    pub async fn publish_users(&self, users: &[User]) -> Result<usize, WorkerError> {
        for user in users {
            self.publish_user(user).await?;
        }
        info!(queue = %self.queue, count = users.len(), "Published aggregates");
        Ok(users.len())
    }
}
