use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;
use turn_rs::config::Config;
use turn_rs::quota::QuotaEngine;
use turn_rs::reaper::SessionReaper;
use turn_rs::sessions::SessionTable;
use turn_rs::users::UserRegistry;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = if std::path::Path::new("config.toml").exists() {
        Config::from_file("config.toml")?
    } else {
        Config::default()
    };

    // Initialize logging
    let level = config
        .logging
        .level
        .parse()
        .unwrap_or(tracing::Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");

    info!("Starting turn-rs quota service");
    info!("  Store: {}", config.store.database_url);
    info!("  Usage reset period: {}s", config.quota.reset_period_secs);
    info!(
        "  Reaper: every {}s, inactivity threshold {}s",
        config.reaper.sweep_interval_secs, config.reaper.inactivity_threshold_secs
    );

    // Connect the durable store and initialize both tables
    let pool = Arc::new(sqlx::SqlitePool::connect(&config.store.database_url).await?);

    let registry = UserRegistry::new(
        pool.clone(),
        chrono::Duration::seconds(config.quota.reset_period_secs),
    );
    let sessions = SessionTable::new(pool.clone());
    registry.init_db().await?;
    sessions.init_db().await?;

    let engine = QuotaEngine::new(registry, sessions, config.quota.max_conflict_retries);

    // Start the reaper in a separate task
    let reaper = SessionReaper::new(engine, &config.reaper);
    let reaper_handle = tokio::spawn(reaper.run());

    info!("turn-rs ready");

    // Run until interrupted (or the reaper task dies)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = reaper_handle => {
            match result {
                Ok(()) => info!("Reaper exited"),
                Err(e) => error!("Reaper task panic: {}", e),
            }
        }
    }

    pool.close().await;
    Ok(())
}
