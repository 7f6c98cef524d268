//! # Test doubles
//!
//! [`MockGateway`] replays scripted [`PersistenceGateway`] responses in order and records
//! what it was asked to save. [`RecordingTransport`] is a [`QueueTransport`] that keeps
//! everything it is told and lets a test push deliveries straight into a registered
//! handler.
//!
//! ```ignore
//! let gateway = MockGateway::new();
//! gateway.expect_save_all().return_err(PersistenceError::Rejected("down".into()));
//! gateway.expect_save_all().return_ok();
//!
//! let worker = BatchIngestionWorker::new(transport, gateway.gateway(), &config);
//! // ... drive the worker ...
//! gateway.verify(); // panics if an expectation was not consumed
//! ```

use crate::lock;
use crate::model::User;
use crate::persistence::{FindFilters, PersistenceError, PersistenceGateway};
use crate::transport::{
    dead_letter_topology, AckProbe, Acker, ConsumeOptions, Delivery, DeliveryHandler,
    PublishOptions, QueueOptions, QueueTransport, TransportError,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// PERSISTENCE
// =============================================================================

enum Expectation {
    SaveAll(SaveResponse),
    Find(Result<Vec<User>, PersistenceError>),
}

enum SaveResponse {
    Ok,
    Err(PersistenceError),
    /// Never completes; exercises the caller's timeout.
    Stall,
}

#[derive(Default)]
struct GatewayState {
    expectations: Mutex<VecDeque<Expectation>>,
    saved: Mutex<Vec<Vec<User>>>,
    queries: Mutex<Vec<FindFilters>>,
}

/// Scripted [`PersistenceGateway`]. Clones share expectations and records.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<GatewayState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gateway(&self) -> Arc<dyn PersistenceGateway> {
        Arc::new(self.clone())
    }

    pub fn expect_save_all(&self) -> SaveAllExpectationBuilder {
        SaveAllExpectationBuilder {
            state: self.state.clone(),
        }
    }

    pub fn expect_find(&self) -> FindExpectationBuilder {
        FindExpectationBuilder {
            state: self.state.clone(),
        }
    }

    /// Every batch passed to `save_all`, including failed ones, in call order.
    pub fn saved_batches(&self) -> Vec<Vec<User>> {
        lock(&self.state.saved).clone()
    }

    pub fn queries(&self) -> Vec<FindFilters> {
        lock(&self.state.queries).clone()
    }

    /// Panics unless every expectation was consumed.
    pub fn verify(&self) {
        let remaining = lock(&self.state.expectations).len();
        if remaining > 0 {
            panic!("Not all expectations were met. {} remaining", remaining);
        }
    }

    fn next(&self) -> Option<Expectation> {
        lock(&self.state.expectations).pop_front()
    }
}

#[async_trait]
impl PersistenceGateway for MockGateway {
    async fn save_all(&self, users: &[User]) -> Result<(), PersistenceError> {
        lock(&self.state.saved).push(users.to_vec());
        match self.next() {
            Some(Expectation::SaveAll(SaveResponse::Ok)) => Ok(()),
            Some(Expectation::SaveAll(SaveResponse::Err(e))) => Err(e),
            Some(Expectation::SaveAll(SaveResponse::Stall)) => {
                std::future::pending::<Result<(), PersistenceError>>().await
            }
            _ => panic!("Unexpected save_all of {} users", users.len()),
        }
    }

    async fn find(&self, filters: &FindFilters) -> Result<Vec<User>, PersistenceError> {
        lock(&self.state.queries).push(filters.clone());
        match self.next() {
            Some(Expectation::Find(response)) => response,
            _ => panic!("Unexpected find with {:?}", filters),
        }
    }
}

/// Builder for `save_all` expectations.
pub struct SaveAllExpectationBuilder {
    state: Arc<GatewayState>,
}

impl SaveAllExpectationBuilder {
    fn push(self, response: SaveResponse) {
        lock(&self.state.expectations).push_back(Expectation::SaveAll(response));
    }

    pub fn return_ok(self) {
        self.push(SaveResponse::Ok);
    }

    pub fn return_err(self, error: PersistenceError) {
        self.push(SaveResponse::Err(error));
    }

    pub fn stall(self) {
        self.push(SaveResponse::Stall);
    }
}

/// Builder for `find` expectations.
pub struct FindExpectationBuilder {
    state: Arc<GatewayState>,
}

impl FindExpectationBuilder {
    pub fn return_ok(self, users: Vec<User>) {
        lock(&self.state.expectations).push_back(Expectation::Find(Ok(users)));
    }

    pub fn return_err(self, error: PersistenceError) {
        lock(&self.state.expectations).push_back(Expectation::Find(Err(error)));
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub options: PublishOptions,
}

/// [`QueueTransport`] that records calls instead of talking to a broker.
pub struct RecordingTransport {
    connected: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    declared: Mutex<Vec<(String, QueueOptions)>>,
    consumers: Mutex<Vec<(String, Arc<dyn DeliveryHandler>)>>,
    publish_failure: Mutex<Option<TransportError>>,
    retry_delay: Duration,
}

impl Default for RecordingTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            declared: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            publish_failure: Mutex::new(None),
            retry_delay: Duration::from_secs(30),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn declared(&self) -> Vec<(String, QueueOptions)> {
        lock(&self.declared).clone()
    }

    pub fn consumer_queues(&self) -> Vec<String> {
        lock(&self.consumers).iter().map(|(q, _)| q.clone()).collect()
    }

    /// Makes every later `publish` fail with `error`.
    pub fn fail_publishes(&self, error: TransportError) {
        *lock(&self.publish_failure) = Some(error);
    }

    /// Hands a delivery to the first handler registered on `queue` and waits for it.
    pub async fn deliver(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<AckProbe, TransportError> {
        let handler = lock(&self.consumers)
            .iter()
            .find(|(q, _)| q == queue)
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        let (acker, probe) = Acker::probe();
        let delivery = Delivery::new(queue, payload, options.into_properties());
        // Handler errors are the handler's business; the probe shows the settlement.
        let _ = handler.handle(delivery, acker).await;
        Ok(probe)
    }
}

#[async_trait]
impl QueueTransport for RecordingTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.consumers).clear();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        if let Some(error) = lock(&self.publish_failure).clone() {
            return Err(error);
        }
        lock(&self.published).push(PublishedMessage {
            queue: queue.to_string(),
            payload,
            options,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn DeliveryHandler>,
        _options: ConsumeOptions,
    ) -> Result<(), TransportError> {
        lock(&self.consumers).push((queue.to_string(), handler));
        Ok(())
    }

    async fn assert_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        lock(&self.declared).push((queue.to_string(), options));
        Ok(())
    }

    async fn setup_dead_letter_queue(
        &self,
        queue: &str,
        suffix: &str,
    ) -> Result<(), TransportError> {
        for (name, options) in dead_letter_topology(queue, suffix, self.retry_delay) {
            self.assert_queue(&name, options).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_replays_in_order() {
        let mock = MockGateway::new();
        mock.expect_save_all()
            .return_err(PersistenceError::Rejected("first".into()));
        mock.expect_save_all().return_ok();
        mock.expect_find().return_ok(vec![User::new(1, "Ann")]);

        let gateway = mock.gateway();
        assert!(gateway.save_all(&[User::new(1, "Ann")]).await.is_err());
        assert!(gateway.save_all(&[User::new(1, "Ann")]).await.is_ok());
        let found = gateway.find(&FindFilters::default()).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(mock.saved_batches().len(), 2);
        mock.verify();
    }

    #[test]
    #[should_panic(expected = "Not all expectations were met")]
    fn test_verify_panics_on_leftovers() {
        let mock = MockGateway::new();
        mock.expect_save_all().return_ok();
        mock.verify();
    }
}
