use chrono::NaiveDate;
use order_ingest::config::{AckMode, AppConfig};
use order_ingest::lifecycle::IngestionSystem;
use order_ingest::persistence::{FindFilters, PersistenceGateway, StoreCounts};
use order_ingest::transport::QueueTransport;
use std::time::Duration;

fn line(
    user_id: u64,
    name: &str,
    order_id: u64,
    product_id: u64,
    amount: &str,
    date: &str,
) -> String {
    format!(
        "{:0>10}{:>45}{:0>10}{:0>10}{:>12}{}",
        user_id, name, order_id, product_id, amount, date
    )
}

fn extract() -> String {
    [
        line(70, "Palmer Prosacco", 753, 3, "1836.74", "20210308"),
        line(75, "Bobbie Batz", 798, 2, "1578.57", "20211116"),
        "too short".to_string(),
        line(70, "Palmer Prosacco", 753, 4, "201.00", "20210308"),
        line(49, "Ken Wintheiser", 523, 3, "586.74", "20210903"),
        line(70, "Palmer Prosacco", 754, 1, "10.00", "20210401"),
    ]
    .join("\n")
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.worker.batch_size = 2;
    config.worker.batch_timeout = Duration::from_millis(50);
    config.worker.flush_timeout = Duration::from_secs(2);
    config.transport.reconnect_base_delay = Duration::from_millis(10);
    config.transport.reconnect_max_delay = Duration::from_millis(50);
    config
}

async fn wait_for_users(system: &IngestionSystem, users: usize) -> StoreCounts {
    let mut counts = system.store.counts().await;
    for _ in 0..300 {
        if counts.users >= users {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        counts = system.store.counts().await;
    }
    counts
}

/// Waits until `queue` holds no ready or unacknowledged messages.
async fn wait_for_drained(system: &IngestionSystem, queue: &str) -> usize {
    let mut pending = usize::MAX;
    for _ in 0..300 {
        if let Some(stats) = system.broker.stats(queue).await {
            pending = stats.ready + stats.unacked;
        }
        if pending == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    pending
}

/// Extract in, persisted aggregates out, through the real broker and store actors.
#[tokio::test]
async fn test_full_ingestion_pipeline() {
    let system = IngestionSystem::new(&config());
    system.start().await.expect("Failed to start");

    let report = system.ingest(&extract()).await.expect("Failed to ingest");
    assert_eq!(report.users, 3);
    assert_eq!(report.published, 3);
    assert_eq!(report.skipped_lines, 1);

    let counts = wait_for_users(&system, 3).await;
    assert_eq!(
        counts,
        StoreCounts {
            users: 3,
            orders: 4,
            order_lines: 5
        }
    );

    let summaries = system
        .query
        .execute(&FindFilters::default())
        .await
        .expect("Failed to query");
    let ids: Vec<u64> = summaries.iter().map(|u| u.user_id).collect();
    assert_eq!(ids, vec![49, 70, 75]);

    let palmer = &summaries[1];
    assert_eq!(palmer.name, "Palmer Prosacco");
    assert_eq!(palmer.orders.len(), 2);
    assert_eq!(palmer.orders[0].order_id, 753);
    assert_eq!(palmer.orders[0].date, "2021-03-08");
    assert_eq!(palmer.orders[0].total, "2037.74");
    assert_eq!(palmer.orders[1].date, "2021-04-01");

    let march = system
        .store
        .find(
            &FindFilters::default()
                .start_date(NaiveDate::from_ymd_opt(2021, 3, 1).unwrap())
                .end_date(NaiveDate::from_ymd_opt(2021, 3, 31).unwrap()),
        )
        .await
        .unwrap();
    assert_eq!(march.len(), 1);
    assert_eq!(march[0].id.0, 70);
    assert_eq!(march[0].orders.len(), 1);

    assert_eq!(wait_for_drained(&system, "user-orders").await, 0);

    system.shutdown().await.expect("Shutdown failed");
}

/// Ingesting the same extract twice converges to the same stored state.
#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let system = IngestionSystem::new(&config());
    system.start().await.unwrap();

    system.ingest(&extract()).await.unwrap();
    let first = wait_for_users(&system, 3).await;
    system.ingest(&extract()).await.unwrap();
    system.worker.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(system.store.counts().await, first);
    system.shutdown().await.unwrap();
}

/// A failing batch sends its trigger delivery through the dead-letter queue, where the
/// retry coordinator persists it.
#[tokio::test]
async fn test_failed_flush_recovers_through_dead_letter_queue() {
    let mut cfg = config();
    cfg.worker.batch_size = 1;
    cfg.worker.batch_timeout = Duration::from_secs(3600);
    let system = IngestionSystem::new(&cfg);
    system.start().await.unwrap();
    system.store.fail_next_saves(1, "serialization failure").await;

    system
        .ingest(&line(70, "Palmer Prosacco", 753, 3, "1836.74", "20210308"))
        .await
        .unwrap();

    let counts = wait_for_users(&system, 1).await;
    assert_eq!(counts.users, 1);
    assert_eq!(wait_for_drained(&system, "user-orders.dlq").await, 0);
    assert_eq!(wait_for_drained(&system, "user-orders").await, 0);

    system.shutdown().await.unwrap();
}

/// With acks held until commit, a failed batch goes to the dead-letter queue in full.
#[tokio::test]
async fn test_after_flush_mode_retries_whole_batch() {
    let mut cfg = config();
    cfg.worker.ack_mode = AckMode::AfterFlush;
    let system = IngestionSystem::new(&cfg);
    system.start().await.unwrap();
    system.store.fail_next_saves(1, "serialization failure").await;

    system.ingest(&extract()).await.unwrap();

    let counts = wait_for_users(&system, 3).await;
    assert_eq!(counts.users, 3);
    system.shutdown().await.unwrap();
}

/// Losing the broker connection triggers a background reconnect; consumers come back
/// and later messages are still persisted.
#[tokio::test]
async fn test_pipeline_survives_connection_loss() {
    let system = IngestionSystem::new(&config());
    system.start().await.unwrap();

    assert_eq!(system.broker.drop_connections().await, 1);
    for _ in 0..200 {
        if system.transport.reconnect_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(system.transport.reconnect_count(), 1);
    assert!(system.transport.is_connected());

    system.ingest(&extract()).await.unwrap();
    assert_eq!(wait_for_users(&system, 3).await.users, 3);

    let main = system.broker.stats("user-orders").await.unwrap();
    assert_eq!(main.consumers, 1);
    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_while_disconnected_fails() {
    let system = IngestionSystem::new(&config());
    let err = system.ingest(&extract()).await.unwrap_err();
    assert_eq!(err.to_string(), "Transport not connected");
    assert!(system.transport.disconnect().await.is_ok());
    system.shutdown().await.unwrap();
}

/// Held acks survive a dropped connection: the broker requeues the unacked batch, the
/// restored consumer buffers it again and one flush settles everything.
#[tokio::test]
async fn test_after_flush_batch_is_redelivered_after_connection_loss() {
    let mut cfg = config();
    cfg.worker.ack_mode = AckMode::AfterFlush;
    cfg.worker.batch_size = 50;
    cfg.worker.batch_timeout = Duration::from_secs(3600);
    let system = IngestionSystem::new(&cfg);
    system.start().await.unwrap();

    system.ingest(&extract()).await.unwrap();
    for _ in 0..300 {
        if system.worker.buffered_len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(system.worker.buffered_len(), 3);
    assert_eq!(system.broker.stats("user-orders").await.unwrap().unacked, 3);

    assert_eq!(system.broker.drop_connections().await, 1);
    for _ in 0..300 {
        if system.worker.buffered_len() == 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(system.transport.reconnect_count(), 1);
    assert_eq!(system.worker.buffered_len(), 6);

    assert_eq!(system.worker.flush().await.unwrap(), 6);
    assert_eq!(system.store.counts().await.users, 3);
    assert_eq!(wait_for_drained(&system, "user-orders").await, 0);
    system.shutdown().await.unwrap();
}
