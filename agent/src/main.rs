//! Hoard Agent - keeps a local SQLite cache in step with PostgreSQL.
//!
//! The agent opens the cache, points the sync engine at the `records` table
//! of the configured database and runs auto-sync until interrupted.

mod config;
mod db;
mod error;
mod remote;
mod schema;

use crate::config::AgentConfig;
use crate::remote::PgRemoteStore;
use hoard_engine::{AutoSync, ConflictResolver, SyncEngine, SyncEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hoard_agent=debug,hoard_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AgentConfig::from_env()?;
    let schema = schema::load_schema(config.schema_path.as_deref())?;

    tracing::info!(
        cache = %config.cache_path.display(),
        tables = schema.tables.len(),
        "Starting Hoard Agent"
    );

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await?;

    let engine = SyncEngine::builder(schema, Arc::new(PgRemoteStore::new(pool)))
        .config(config.sync.clone())
        .path(config.cache_path.clone())
        .resolver(ConflictResolver::standard())
        .build()?;
    let engine = Arc::new(engine);

    tokio::spawn(log_events(engine.subscribe()));

    let auto = AutoSync::new(engine.clone());
    // first cycle right away instead of one interval in
    auto.trigger().notify_one();
    auto.run(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    })
    .await;

    let stats = engine.store().stats()?;
    tracing::info!(
        records = stats.records,
        bytes = stats.size_bytes,
        "Hoard Agent stopped"
    );
    Ok(())
}

async fn log_events(mut events: tokio::sync::broadcast::Receiver<SyncEvent>) {
    loop {
        match events.recv().await {
            Ok(SyncEvent::SyncStarted) => tracing::debug!("sync started"),
            Ok(SyncEvent::SyncProgress {
                phase,
                current,
                total,
                table,
            }) => tracing::debug!(?phase, current, total, ?table, "sync progress"),
            Ok(SyncEvent::ConflictDetected { conflict }) => tracing::warn!(
                id = %conflict.id,
                table = %conflict.table,
                record = %conflict.record_id,
                severity = ?conflict.severity,
                auto = conflict.auto_resolvable,
                "conflict detected"
            ),
            Ok(SyncEvent::ConflictResolved { resolution }) => tracing::info!(
                id = %resolution.conflict_id,
                kind = ?resolution.kind,
                strategy = ?resolution.strategy_name,
                "conflict resolved"
            ),
            Ok(SyncEvent::SyncCompleted { result }) => tracing::info!(
                uploaded = result.uploaded,
                downloaded = result.downloaded,
                conflicts = result.conflicts.len(),
                unresolved = result.unresolved.len(),
                errors = result.errors.len(),
                duration_ms = result.duration_ms,
                "sync completed"
            ),
            Ok(SyncEvent::SyncFailed { error }) => tracing::error!(%error, "sync failed"),
            Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
