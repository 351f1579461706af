//! TaskSync daemon entry point.
//!
//! Loads configuration, opens the database, prepares the credential vault
//! and runs the polling scheduler until a shutdown signal arrives.

mod scheduler;
mod signals;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tasksync_core::config::AppConfig;
use tasksync_core::db::Database;
use tasksync_core::locks::staleness_cutoff;
use tasksync_core::SyncService;

/// How long a pass in flight may take to finish after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// TaskSync synchronization daemon.
#[derive(Parser, Debug)]
#[command(
    name = "tasksync-daemon",
    version,
    about = "Polls the remote task provider and syncs every connected user"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the log level from the config file (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config =
        AppConfig::load_and_resolve(&args.config).context("failed to load configuration")?;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .init();

    info!("========================================");
    info!("  TaskSync Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", args.config.display());
    info!("Provider      : {} ({})", config.provider.name, config.provider.api_url);
    info!("Poll interval : {}s", config.daemon.poll_interval_secs);
    info!("Data dir      : {}", config.daemon.data_dir.display());
    info!("Log level     : {}", log_level);
    info!("========================================");

    std::fs::create_dir_all(&config.daemon.data_dir).context("failed to create data directory")?;

    let db_path = config.daemon.db_path();
    let db = Database::new(&db_path).context("failed to open database")?;
    db.initialize()
        .context("failed to initialize database schema")?;
    let db = Arc::new(db);
    info!("Database initialized at {}", db_path.display());

    // Passes with a recent heartbeat may belong to a CLI process sharing the
    // database, so only stale ones are reset.
    let interrupted = db
        .reset_interrupted_syncs(staleness_cutoff(config.sync.lease_ttl()))
        .context("failed to reset interrupted syncs")?;
    if interrupted > 0 {
        warn!(count = interrupted, "marked interrupted sync passes as failed");
    }

    let service = Arc::new(
        SyncService::from_config(&config, db).context("failed to initialize sync service")?,
    );

    audit_credentials(&service);

    if config.vault.rotate_on_start {
        rotate_all(&service);
    }

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let scheduler_shutdown = shutdown.clone();
    let sched = scheduler::Scheduler::new(
        service.clone(),
        Duration::from_secs(config.daemon.poll_interval_secs),
    );
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // A stored permit lets a scheduler that is mid-cycle stop right after it.
    shutdown.notify_one();

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!(
            "scheduler did not stop within {}s, forcing shutdown",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    info!("TaskSync daemon stopped.");
    Ok(())
}

/// Log users whose credential was sealed with a key that is no longer
/// configured. Their passes fail until they reconnect.
fn audit_credentials(service: &SyncService) {
    match service.context().vault.unreadable_credentials() {
        Ok(unreadable) if unreadable.is_empty() => info!("all stored credentials are readable"),
        Ok(unreadable) => {
            for (user_id, key_id) in unreadable {
                warn!(user_id = %user_id, key_id = %key_id, "credential sealed with unknown key; user must reconnect");
            }
        }
        Err(e) => error!(error = %e, "failed to audit stored credentials"),
    }
}

fn rotate_all(service: &SyncService) {
    match service.rotate_all() {
        Ok(reports) => {
            let failed = reports.iter().filter(|r| r.result.is_err()).count();
            info!(
                total = reports.len(),
                failed,
                "startup credential rotation finished"
            );
        }
        Err(e) => error!(error = %e, "startup credential rotation failed"),
    }
}
