mod command;
mod config;
mod db;
mod error;
mod ingest;
mod liveness;
mod scheduler;
mod state;
mod web;

use anyhow::{Context, Result};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::Db;
use state::{EventKind, StatusRegister};
use web::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("plantcare_hub=info")),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let addr = cfg.listen_addr()?;

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(
        &cfg.database.url,
        cfg.database.max_connections,
        cfg.db_timeout(),
    )
    .await
    .with_context(|| format!("failed to connect to sqlite db: {}", cfg.database.url))?;
    db.migrate().await.context("failed to run migrations")?;
    db.ensure_default_settings()
        .await
        .context("failed to seed default settings")?;

    // The live mode starts from the persisted one; after that the two are
    // written independently (commands vs. settings updates).
    let settings = db
        .current_settings()
        .await
        .context("failed to load settings")?;
    info!(
        url = %cfg.database.url,
        threshold = settings.humidity_threshold,
        mode = %settings.watering_mode,
        interval_h = settings.scheduled_interval_hours,
        "db ready"
    );

    // ── Status register (ephemeral, shared by every task) ───────────
    let status = StatusRegister::new(settings.watering_mode);
    status.record(EventKind::System, "hub started").await;

    // ── Background timers ───────────────────────────────────────────
    tokio::spawn(liveness::run(status.clone()));
    tokio::spawn(scheduler::run(db.clone(), status.clone()));

    // ── HTTP API ────────────────────────────────────────────────────
    let app = AppState {
        db: db.clone(),
        status: status.clone(),
    };
    web::serve(addr, app, shutdown_signal()).await?;

    // Pool close waits for connections still checked out by in-flight writes.
    info!("shutting down, draining database connections");
    db.close().await;
    info!("database closed");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
