//! # Order Ingest
//!
//! > **Legacy order extracts in, persisted order aggregates out.**
//!
//! This crate turns a fixed-width text extract of orders into `User → Order → Product`
//! aggregates, pushes each aggregate through a queue, and persists them in batches with
//! at-least-once delivery and bounded dead-letter retries.
//!
//! The shipped broker and store are in-process actors. Delivery guarantees hold across
//! connection loss and worker restarts, not across a process crash: queue and store
//! contents live in memory only.
//!
//! ## Data flow
//!
//! ```text
//! extract ─► FixedWidthOrderParser ─► OrderPublisher ─► <queue>
//!                                                          │
//!                         BatchIngestionWorker ◄───────────┘
//!                           │ buffer, flush by size/timer/shutdown
//!                           ▼
//!                    PersistenceGateway::save_all (one transaction per batch)
//!
//! rejected ─► <queue>.dlq ─► DeadLetterRetryCoordinator ─► save, or republish with
//!                                                          x-retry-count + 1, or discard
//! ```
//!
//! ## Architecture Notes
//!
//! ### 1. Actors own shared state
//! The [`Broker`](transport::Broker) and the [`OrderStore`](persistence::OrderStore) are
//! tokio tasks that own their state and process one request at a time. Callers hold
//! cheap cloneable handles that send requests over channels and await a oneshot reply.
//!
//! ### 2. Traits at the seams
//! The worker only sees [`QueueTransport`](transport::QueueTransport) and
//! [`PersistenceGateway`](persistence::PersistenceGateway). Tests swap in the doubles
//! from [`mock`].
//!
//! ### 3. Type-safe error handling
//! Each layer has its own `thiserror` enum; [`WorkerError`](worker::WorkerError) wraps
//! the lower ones with `#[from]`. Consumer callbacks never let an error escape unsettled:
//! an [`Acker`](transport::Acker) dropped on an error path rejects its delivery.
//!
//! ### 4. Observability
//! Structured `tracing` events everywhere. See [`lifecycle::tracing`].
//!
//! ## Module Tour
//!
//! - [`model`]: aggregates and money formatting.
//! - [`parser`]: the fixed-width extract parser.
//! - [`transport`]: queue abstraction, in-memory broker, reconnecting transport.
//! - [`persistence`]: gateway trait and in-memory upserting store.
//! - [`worker`]: wire payload, publisher and the batch ingestion worker.
//! - [`dead_letter`]: the retry coordinator.
//! - [`ingest`] / [`query`]: use cases.
//! - [`config`]: defaults and environment overrides.
//! - [`lifecycle`]: explicit wiring, graceful shutdown and tracing setup.
//!
//! ### Running
//!
//! ```bash
//! RUST_LOG=info cargo run -- data_1.txt
//! ```

pub mod config;
pub mod dead_letter;
pub mod ingest;
pub mod lifecycle;
pub mod mock;
pub mod model;
pub mod parser;
pub mod persistence;
pub mod query;
pub mod transport;
pub mod worker;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a std mutex, taking the data as is if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
