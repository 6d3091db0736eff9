use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_anchor::anchor::{HttpLedgerClient, InMemoryLedger, LedgerClient};
use audit_anchor::api;
use audit_anchor::config::{AppConfig, LedgerKind};
use audit_anchor::database::{AnchorLedger, Database};
use audit_anchor::service::AnchorPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_anchor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit anchor service");

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database migrations completed");
    let store: Arc<dyn AnchorLedger> = Arc::new(database);

    let ledger = build_ledger(&config)?;
    info!("Using {} ledger", ledger.name());

    let pipeline = Arc::new(AnchorPipeline::new(
        config.batch_policy(),
        config.retry_policy(),
        ledger,
        store,
    ));
    pipeline.resume().await?;

    // Start background tasks
    let worker = pipeline.spawn_batch_worker().await?;
    let ticker = pipeline.spawn_age_ticker(Duration::from_millis(config.batch.tick_interval_ms));
    let reconciler = pipeline.spawn_reconciler(Duration::from_secs(config.reconcile_interval_secs));
    info!("Batch worker, age ticker and reconciler started");

    let app = api::router(pipeline.clone());
    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, flushing open batch");
    if let Err(e) = pipeline.shutdown().await {
        error!("Failed to flush open batch: {}", e);
    }
    for task in [worker, ticker, reconciler] {
        if let Err(e) = task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }

    Ok(())
}

fn build_ledger(config: &AppConfig) -> Result<Arc<dyn LedgerClient>> {
    match config.ledger.kind {
        LedgerKind::Http => {
            let base_url = config
                .ledger
                .base_url
                .clone()
                .context("ledger.base_url is required for the http ledger")?;
            let client = HttpLedgerClient::new(
                base_url,
                Duration::from_secs(config.ledger.request_timeout_secs),
                config.ledger.idempotency_keys,
            )?;
            Ok(Arc::new(client))
        }
        LedgerKind::Memory => Ok(Arc::new(InMemoryLedger::new().auto_confirming())),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
