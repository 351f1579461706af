//! Per-user mutual exclusion shared by every process on one database.
//!
//! Every mutating operation for a user (connect, disconnect, rotate, sync,
//! resolve) runs under a lock keyed by `(user_id, provider)`. The lock has
//! two layers: an async mutex serializes tasks inside this process, and a
//! lease row in `user_leases` serializes processes (the daemon and any CLI
//! invocation). A lease left behind by a crashed process expires after the
//! configured TTL.
//!
//! A sync pass additionally claims the user's `sync_state` row, moving it to
//! `syncing` only if it is idle, so a second `sync_now` fails fast instead of
//! queueing behind the first, whichever process it comes from.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::Database;
use crate::errors::DatabaseError;

/// Lease lifetime and staleness cutoff for `syncing` rows.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// How often a waiter re-checks a lease held by another process.
const LEASE_POLL: Duration = Duration::from_millis(100);

type LockKey = (String, String);
type LockMap = HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>;

/// Registry of per-user locks for one provider.
pub struct UserLocks {
    db: Arc<Database>,
    provider: String,
    holder: String,
    lease_ttl: Duration,
    locks: Arc<Mutex<LockMap>>,
    in_progress: Arc<Mutex<HashSet<String>>>,
}

impl UserLocks {
    pub fn new(db: Arc<Database>, provider: impl Into<String>) -> Self {
        Self {
            db,
            provider: provider.into(),
            holder: Uuid::new_v4().to_string(),
            lease_ttl: DEFAULT_LEASE_TTL,
            locks: Arc::new(Mutex::new(HashMap::new())),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Wait for and take the user's lock, first inside this process and then
    /// across processes.
    pub async fn acquire(&self, user_id: &str) -> Result<UserGuard, DatabaseError> {
        let key = (user_id.to_string(), self.provider.clone());
        let lock = {
            let mut locks = recover(self.locks.lock());
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let local = lock.lock_owned().await;

        // Built before the lease loop so a cancelled or failed wait still
        // releases the local lock and prunes the entry.
        let guard = UserGuard {
            db: self.db.clone(),
            key,
            holder: self.holder.clone(),
            lease_ttl: self.lease_ttl,
            local: Some(local),
            registry: self.locks.clone(),
        };

        let mut waited = false;
        while !self.db.try_acquire_lease(
            user_id,
            &self.provider,
            &self.holder,
            expiry(self.lease_ttl),
        )? {
            if !waited {
                debug!(user_id, provider = %self.provider, "user lease held by another process, waiting");
                waited = true;
            }
            tokio::time::sleep(LEASE_POLL).await;
        }
        debug!(user_id, provider = %self.provider, "user lock acquired");
        Ok(guard)
    }

    /// Claim a sync pass for the user. Returns `None` if one is already
    /// running here or in another process. A `syncing` row whose heartbeat
    /// is older than the lease TTL is treated as abandoned and taken over.
    pub fn try_claim_sync(&self, user_id: &str) -> Result<Option<SyncClaim>, DatabaseError> {
        if !recover(self.in_progress.lock()).insert(user_id.to_string()) {
            return Ok(None);
        }

        let claimed = self.db.try_begin_sync(user_id, staleness_cutoff(self.lease_ttl));
        match claimed {
            Ok(true) => Ok(Some(SyncClaim {
                user_id: user_id.to_string(),
                db: self.db.clone(),
                registry: self.in_progress.clone(),
                settled: false,
            })),
            other => {
                recover(self.in_progress.lock()).remove(user_id);
                other.map(|_| None)
            }
        }
    }

    /// Whether a pass claimed by this process is running for the user.
    pub fn is_syncing(&self, user_id: &str) -> bool {
        recover(self.in_progress.lock()).contains(user_id)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        recover(self.locks.lock()).len()
    }
}

fn recover<T>(result: std::sync::LockResult<MutexGuard<'_, T>>) -> MutexGuard<'_, T> {
    result.unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_chrono(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + to_chrono(ttl)
}

/// Heartbeats older than this belong to a pass that is no longer running.
pub fn staleness_cutoff(ttl: Duration) -> DateTime<Utc> {
    Utc::now() - to_chrono(ttl)
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Held user lock. Dropping it releases the lease, then the local mutex, and
/// forgets the mutex once no other task refers to it.
pub struct UserGuard {
    db: Arc<Database>,
    key: LockKey,
    holder: String,
    lease_ttl: Duration,
    local: Option<OwnedMutexGuard<()>>,
    registry: Arc<Mutex<LockMap>>,
}

impl UserGuard {
    /// Push the lease expiry out by another TTL. Returns `false` if the lease
    /// expired and another process took it.
    pub fn renew(&self) -> Result<bool, DatabaseError> {
        let (user_id, provider) = &self.key;
        self.db
            .renew_lease(user_id, provider, &self.holder, expiry(self.lease_ttl))
    }
}

impl Drop for UserGuard {
    fn drop(&mut self) {
        let (user_id, provider) = &self.key;
        if let Err(e) = self.db.release_lease(user_id, provider, &self.holder) {
            warn!(user_id = %user_id, error = %e, "failed to release user lease; it will expire");
        }
        drop(self.local.take());

        let mut locks = recover(self.registry.lock());
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

/// A claimed sync pass. Settle it with [`SyncClaim::finish`] or
/// [`SyncClaim::cancel`]; a claim dropped unsettled (a panic or an aborted
/// task) returns the user to idle with an "interrupted" error.
pub struct SyncClaim {
    user_id: String,
    db: Arc<Database>,
    registry: Arc<Mutex<HashSet<String>>>,
    settled: bool,
}

impl SyncClaim {
    /// Record the pass outcome and return the user to idle.
    pub fn finish(
        &mut self,
        completed_at: DateTime<Utc>,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        self.settled = true;
        self.db.finish_sync(&self.user_id, completed_at, error)
    }

    /// Return the user to idle without recording a pass.
    pub fn cancel(&mut self) -> Result<(), DatabaseError> {
        self.settled = true;
        self.db.release_sync(&self.user_id, None)
    }

    /// Refresh the claim's heartbeat so other processes keep treating it as
    /// live.
    pub fn heartbeat(&self) -> Result<(), DatabaseError> {
        self.db.touch_sync(&self.user_id)
    }
}

impl Drop for SyncClaim {
    fn drop(&mut self) {
        if !self.settled {
            if let Err(e) = self.db.release_sync(&self.user_id, Some("sync interrupted")) {
                warn!(user_id = %self.user_id, error = %e, "failed to release sync claim");
            }
        }
        recover(self.registry.lock()).remove(&self.user_id);
    }
}
