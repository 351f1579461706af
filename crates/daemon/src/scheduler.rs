//! Polling scheduler that runs a sync pass for every connected user on a
//! fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use tasksync_core::errors::ActionErrorKind;
use tasksync_core::SyncService;

/// Aggregate statistics across polling cycles.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub users_synced: AtomicU64,
    pub users_failed: AtomicU64,
    pub total_conflicts: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// What one cycle did, for logging and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub conflicts: u64,
}

pub struct Scheduler {
    service: Arc<SyncService>,
    poll_interval: Duration,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    pub fn new(service: Arc<SyncService>, poll_interval: Duration) -> Self {
        Self {
            service,
            poll_interval,
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Run cycles until `shutdown` is notified. A cycle in flight is always
    /// allowed to finish.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            "scheduler started"
        );

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.notified() => {
                    info!("scheduler received shutdown");
                    break;
                }
            }
        }
    }

    /// Sync every connected user once.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!(cycle, "starting polling cycle");

        let results = match self.service.sync_all_connected().await {
            Ok(results) => results,
            Err(e) => {
                let consecutive = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(cycle, error = %e, consecutive_errors = consecutive, "could not list connected users");
                return CycleReport::default();
            }
        };
        self.stats.consecutive_errors.store(0, Ordering::SeqCst);

        let mut report = CycleReport::default();
        for (user_id, result) in results {
            match result {
                Ok(summary) => {
                    report.succeeded += 1;
                    report.conflicts += u64::from(summary.conflicts);
                }
                // Another task or process holds the user's pass; pick it up next cycle.
                Err(e) if e.kind() == ActionErrorKind::AlreadyInProgress => {
                    report.skipped += 1;
                    info!(cycle, user_id = %user_id, "sync already in progress, skipping");
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(cycle, user_id = %user_id, error = %e, kind = %e.kind(), "user sync failed");
                }
            }
        }

        self.stats
            .users_synced
            .fetch_add(report.succeeded as u64, Ordering::SeqCst);
        self.stats
            .users_failed
            .fetch_add(report.failed as u64, Ordering::SeqCst);
        self.stats
            .total_conflicts
            .fetch_add(report.conflicts, Ordering::SeqCst);

        info!(
            cycle,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            conflicts = report.conflicts,
            "polling cycle completed"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use tasksync_core::db::Database;
    use tasksync_core::local::SqliteLocalStore;
    use tasksync_core::models::EntityType;
    use tasksync_core::notify::Notifier;
    use tasksync_core::remote::{MemoryProvider, RetryPolicy};
    use tasksync_core::vault::keyring::KeyRing;
    use tasksync_core::{CredentialVault, SyncContext};

    fn service(provider: Arc<MemoryProvider>) -> Arc<SyncService> {
        let db = Arc::new(Database::in_memory().unwrap());
        db.initialize().unwrap();
        let vault = Arc::new(CredentialVault::new(
            db.clone(),
            KeyRing::single("k1", [7u8; 32]),
            "remote",
        ));
        let ctx = Arc::new(SyncContext::new(
            db,
            vault,
            provider,
            Arc::new(SqliteLocalStore::new()),
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        Arc::new(SyncService::new(ctx, Arc::new(Notifier::new()), true))
    }

    #[tokio::test]
    async fn test_cycle_without_users_is_empty() {
        let sched = Scheduler::new(service(Arc::new(MemoryProvider::new("t"))), Duration::from_secs(60));
        assert_eq!(sched.run_cycle().await, CycleReport::default());
        assert_eq!(sched.stats().total_cycles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_counts_successes_and_failures() {
        let provider = Arc::new(MemoryProvider::new("good"));
        provider.accept_token("bad");
        provider.insert(EntityType::Task, json!({"title": "Water plants"}));

        let service = service(provider.clone());
        service.connect("alice", "good").await.unwrap();
        service.connect("bob", "bad").await.unwrap();
        provider.revoke_token("bad");

        let sched = Scheduler::new(service, Duration::from_secs(60));
        let report = sched.run_cycle().await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(sched.stats().users_failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cycle_skips_user_with_pass_in_flight() {
        let provider = Arc::new(MemoryProvider::new("good"));
        let service = service(provider);
        service.connect("alice", "good").await.unwrap();

        let _claim = service
            .context()
            .locks
            .try_claim_sync("alice")
            .unwrap()
            .unwrap();
        let sched = Scheduler::new(service, Duration::from_secs(60));
        let report = sched.run_cycle().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(sched.stats().users_failed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sched = Scheduler::new(service(Arc::new(MemoryProvider::new("t"))), Duration::from_secs(3600));
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move { sched.run(stop).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
