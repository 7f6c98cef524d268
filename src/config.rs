//! Runtime configuration.
//!
//! [`AppConfig::default`] carries the production defaults; [`AppConfig::from_env`] layers
//! environment overrides on top. Durations given in seconds unless the variable name
//! says `_MS`.

use crate::transport::TransportConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    OutOfRange { key: &'static str },
}

/// When main-queue deliveries are acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Ack as soon as the aggregate is buffered. Buffered aggregates are lost if the
    /// worker stops before the next flush without running `shutdown`.
    #[default]
    OnBuffer,
    /// Hold every ack until the batch containing the delivery commits. If the broker
    /// connection drops before the flush, the broker requeues and redelivers the batch;
    /// a failed flush nacks it into the dead-letter queue.
    ///
    /// With [`InMemoryTransport`](crate::transport::InMemoryTransport) the broker lives in
    /// this process, so nothing survives a process crash in either mode.
    AfterFlush,
}

impl FromStr for AckMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-buffer" | "on_buffer" => Ok(Self::OnBuffer),
            "after-flush" | "after_flush" => Ok(Self::AfterFlush),
            _ => Err(()),
        }
    }
}

/// Where a failed dead-letter retry is republished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetryRoute {
    /// Straight back into `<queue>.dlq`.
    #[default]
    DeadLetterQueue,
    /// Into `<queue>.retry`, which holds it for the retry delay and then dead-letters it
    /// back into `<queue>`.
    DelayQueue,
}

impl FromStr for RetryRoute {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dlq" | "dead-letter" => Ok(Self::DeadLetterQueue),
            "retry" | "delay" => Ok(Self::DelayQueue),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub dlq_suffix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "user-orders".to_string(),
            dlq_suffix: ".dlq".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub batch_size: usize,
    /// Period of the partial-batch flush timer.
    pub batch_timeout: Duration,
    pub prefetch_count: usize,
    /// Upper bound for one `save_all` call.
    pub flush_timeout: Duration,
    pub ack_mode: AckMode,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_timeout: Duration::from_secs(5),
            prefetch_count: 100,
            flush_timeout: Duration::from_secs(30),
            ack_mode: AckMode::OnBuffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub dlq_prefetch: usize,
    pub route: RetryRoute,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dlq_prefetch: 10,
            route: RetryRoute::DeadLetterQueue,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub transport: TransportConfig,
}

impl AppConfig {
    /// Defaults overridden by process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each known key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(name) = lookup("RABBITMQ_QUEUE") {
            config.queue.name = name;
        }
        if let Some(suffix) = lookup("DLQ_SUFFIX") {
            config.queue.dlq_suffix = suffix;
        }

        if let Some(v) = parsed::<usize>(&lookup, "BATCH_SIZE")? {
            config.worker.batch_size = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "BATCH_TIMEOUT")? {
            config.worker.batch_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed::<usize>(&lookup, "PREFETCH_COUNT")? {
            config.worker.prefetch_count = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "FLUSH_TIMEOUT")? {
            config.worker.flush_timeout = Duration::from_secs(v);
        }
        if let Some(v) = parsed::<AckMode>(&lookup, "ACK_MODE")? {
            config.worker.ack_mode = v;
        }

        if let Some(v) = parsed::<u32>(&lookup, "MAX_RETRIES")? {
            config.retry.max_retries = v;
        }
        if let Some(v) = parsed::<u64>(&lookup, "RETRY_DELAY")? {
            config.transport.retry_delay = Duration::from_secs(v);
        }
        if let Some(v) = parsed::<usize>(&lookup, "DLQ_PREFETCH")? {
            config.retry.dlq_prefetch = v;
        }
        if let Some(v) = parsed::<RetryRoute>(&lookup, "RETRY_ROUTE")? {
            config.retry.route = v;
        }

        if let Some(v) = parsed::<u64>(&lookup, "RECONNECT_BASE_DELAY_MS")? {
            config.transport.reconnect_base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parsed::<u64>(&lookup, "RECONNECT_MAX_DELAY_MS")? {
            config.transport.reconnect_max_delay = Duration::from_millis(v);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.batch_size == 0 {
            return Err(ConfigError::OutOfRange { key: "BATCH_SIZE" });
        }
        if self.worker.prefetch_count == 0 {
            return Err(ConfigError::OutOfRange {
                key: "PREFETCH_COUNT",
            });
        }
        if self.retry.dlq_prefetch == 0 {
            return Err(ConfigError::OutOfRange { key: "DLQ_PREFETCH" });
        }
        if self.worker.batch_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                key: "BATCH_TIMEOUT",
            });
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
