//! Runtime orchestration and lifecycle management.
//!
//! - [`IngestionSystem`] builds every component explicitly, wires them together, and
//!   tears them down in order.
//! - [`setup_tracing`] initializes the tracing/logging infrastructure.

pub mod tracing;

pub use self::tracing::*;

use crate::config::AppConfig;
use crate::ingest::{IngestReport, ProcessOrderFile};
use crate::parser::FixedWidthOrderParser;
use crate::persistence::OrderStore;
use crate::query::QueryOrders;
use crate::transport::{Broker, InMemoryTransport, QueueTransport};
use crate::worker::{BatchIngestionWorker, OrderPublisher, WorkerError};
use ::tracing::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const ACTOR_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// The whole ingestion pipeline running in-process.
///
/// Broker and store are tasks of this process, so everything queued or stored is lost
/// when it exits.
///
/// # Example
///
/// ```ignore
/// let system = IngestionSystem::new(&AppConfig::from_env()?);
/// system.start().await?;
/// system.ingest(&std::fs::read_to_string("data_1.txt")?).await?;
/// // ...
/// system.shutdown().await?;
/// ```
pub struct IngestionSystem {
    pub broker: Broker,
    pub transport: InMemoryTransport,
    pub store: OrderStore,
    pub worker: BatchIngestionWorker,
    pub process_file: ProcessOrderFile,
    pub query: QueryOrders,

    /// Broker and store actor tasks.
    handles: Vec<JoinHandle<()>>,
}

impl IngestionSystem {
    /// Spawns the broker and store actors and wires the worker and use cases to them.
    /// Nothing connects until [`start`](Self::start).
    pub fn new(config: &AppConfig) -> Self {
        let (broker_actor, broker) = Broker::new();
        let (store_actor, store) = OrderStore::new(32);
        let broker_handle = tokio::spawn(broker_actor.run());
        let store_handle = tokio::spawn(store_actor.run());

        let transport = InMemoryTransport::new(broker.clone(), config.transport.clone());
        let shared_transport: Arc<dyn QueueTransport> = Arc::new(transport.clone());
        let gateway = Arc::new(store.clone());

        let worker = BatchIngestionWorker::new(shared_transport.clone(), gateway.clone(), config);
        let process_file = ProcessOrderFile::new(
            FixedWidthOrderParser::new(),
            OrderPublisher::new(shared_transport, config.queue.name.clone()),
        );
        let query = QueryOrders::new(gateway);

        Self {
            broker,
            transport,
            store,
            worker,
            process_file,
            query,
            handles: vec![broker_handle, store_handle],
        }
    }

    pub async fn start(&self) -> Result<(), WorkerError> {
        self.worker.start().await
    }

    pub async fn ingest(&self, content: &str) -> Result<IngestReport, WorkerError> {
        self.process_file.execute(content).await
    }

    /// Shuts the worker down (final flush, disconnect), then stops the actors.
    ///
    /// The worker's error is returned first; actor tasks that fail to stop are reported
    /// after it.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        info!("Shutting down system...");
        let worker_result = self.worker.shutdown().await;

        drop(self.worker);
        drop(self.process_file);
        drop(self.query);
        drop(self.transport);
        drop(self.store);
        drop(self.broker);

        let mut actor_failure = None;
        for handle in self.handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(ACTOR_STOP_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!("Actor task failed: {:?}", e);
                    actor_failure.get_or_insert(format!("Actor task failed: {:?}", e));
                }
                Err(_) => {
                    warn!("Actor task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }

        worker_result?;
        if let Some(message) = actor_failure {
            return Err(WorkerError::Shutdown(message));
        }
        info!("System shutdown complete.");
        Ok(())
    }
}
