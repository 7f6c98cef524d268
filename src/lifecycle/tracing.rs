//! # Observability & Tracing
//!
//! [`setup_tracing`] installs a compact `tracing-subscriber` formatter filtered by
//! `RUST_LOG`. Every component logs structured events with key/value fields; these
//! events are the only place operators see dropped lines, rejected messages, failed
//! flushes, discarded retries and reconnects.
//!
//! ```bash
//! # Batches, reconnects, retries
//! RUST_LOG=info order-ingest data_1.txt
//!
//! # Per-message buffering and broker dispatch
//! RUST_LOG=debug order-ingest data_1.txt
//!
//! # Only the worker
//! RUST_LOG=order_ingest::worker=debug order-ingest data_1.txt
//! ```
//!
//! With `RUST_LOG=info` a healthy run looks like:
//!
//! ```text
//! INFO Connected to broker
//! INFO Dead letter queue setup complete queue=user-orders
//! INFO Order processing worker initialized queue=user-orders batch_size=50 ack_mode=OnBuffer
//! WARN line 3: too short (10 chars) line=3
//! INFO Published aggregates queue=user-orders count=2
//! INFO Processing partial batch pending=2
//! INFO Persisting batch in a single transaction count=2
//! INFO Batch persisted count=2
//! ```

/// Installs the global subscriber. Call once, at process start.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
