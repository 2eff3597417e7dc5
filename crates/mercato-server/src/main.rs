//! Mercato write-core server entry point.
//!
//! Assembles the write core against PostgreSQL, runs the outbox poller until
//! Ctrl-C, then drains the poller and the batcher.

use std::sync::Arc;

use mercato_core::clock::{SharedClock, SystemClock};
use mercato_event_store::schema::MIGRATOR;
use mercato_server::config::AppConfig;
use mercato_server::error::AppError;
use mercato_server::state::WriteCore;
use mercato_server::telemetry;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = AppConfig::from_env()?;
    let telemetry = telemetry::init(config.otlp_endpoint.as_deref())?;
    let result = run(config).await;
    if let Err(e) = &result {
        tracing::error!(error = %e, "server stopped with an error");
    }
    telemetry.shutdown();
    result
}

async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!(
        max_connections = config.max_connections,
        "starting Mercato write core"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    MIGRATOR.run(&pool).await?;
    tracing::info!("database migrations applied");

    let clock: SharedClock = Arc::new(SystemClock);
    let core = WriteCore::assemble(&pool, clock, &config)?;
    core.poller.start();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    let stopped = core.shutdown().await;
    pool.close().await;

    let flushed = stopped?;
    tracing::info!(flushed, "Mercato write core stopped");
    Ok(())
}
