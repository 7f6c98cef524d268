//! `order-ingest <FILE>`: parses a legacy order extract, queues every user aggregate and
//! persists them through the batch worker until Ctrl-C.

use clap::Parser;
use order_ingest::config::AppConfig;
use order_ingest::lifecycle::{setup_tracing, IngestionSystem};
use order_ingest::persistence::FindFilters;
use std::path::PathBuf;
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[command(name = "order-ingest", about = "Ingest a fixed-width order extract")]
struct Cli {
    /// Legacy fixed-width extract to ingest.
    file: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    setup_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env().map_err(|e| e.to_string())?;
    let content = tokio::fs::read_to_string(&cli.file)
        .await
        .map_err(|e| format!("Failed to read {}: {}", cli.file.display(), e))?;

    let system = IngestionSystem::new(&config);
    system.start().await.map_err(|e| e.to_string())?;

    let span = info_span!("ingest", file = %cli.file.display());
    match system.ingest(&content).instrument(span).await {
        Ok(report) => info!(
            users = report.users,
            published = report.published,
            skipped_lines = report.skipped_lines,
            "Extract queued"
        ),
        Err(e) => error!(error = %e, "Failed to queue extract"),
    }

    info!("Running until Ctrl-C");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    match system.query.execute(&FindFilters::default()).await {
        Ok(users) => info!(users = users.len(), "Users persisted"),
        Err(e) => error!(error = %e, "Failed to query persisted users"),
    }

    system.shutdown().await.map_err(|e| e.to_string())
}
