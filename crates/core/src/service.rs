//! User-scoped operations for the action layer.
//!
//! [`SyncService`] is the only entry point the CLI, the daemon and any UI
//! use. Every call takes the caller's user id, runs mutations under that
//! user's lock and returns an [`ActionError`] the caller can render a
//! specific message for.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AppConfig;
use crate::conflict::ConflictResolver;
use crate::db::Database;
use crate::errors::{ActionError, CoreError, VaultError};
use crate::local::SqliteLocalStore;
use crate::models::{AuditAction, AuditEntry, ConflictRecord, Resolution, StatusReport, SyncSummary};
use crate::notify::{Notifier, SyncObserver};
use crate::remote::{HttpProvider, RemoteProvider};
use crate::sync_engine::{SyncContext, SyncEngine};
use crate::vault::{CredentialVault, RotationOutcome, RotationReport};

/// Facade over the vault, engine and resolver.
pub struct SyncService {
    ctx: Arc<SyncContext>,
    engine: Arc<SyncEngine>,
    resolver: ConflictResolver,
    verify_on_connect: bool,
}

fn caller(user_id: &str) -> Result<&str, ActionError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ActionError::Forbidden);
    }
    Ok(user_id)
}

impl SyncService {
    pub fn new(
        ctx: Arc<SyncContext>,
        observer: Arc<dyn SyncObserver>,
        verify_on_connect: bool,
    ) -> Self {
        let engine = Arc::new(SyncEngine::new(ctx.clone(), observer));
        let resolver = ConflictResolver::new(ctx.clone());
        Self {
            ctx,
            engine,
            resolver,
            verify_on_connect,
        }
    }

    /// Wire the production stack: HTTP provider, SQLite local store and the
    /// configured notification channels.
    pub fn from_config(config: &AppConfig, db: Arc<Database>) -> Result<Self, CoreError> {
        let keys = config.key_ring()?;
        let vault = Arc::new(CredentialVault::new(
            db.clone(),
            keys,
            config.provider.name.clone(),
        ));
        let provider: Arc<dyn RemoteProvider> = Arc::new(HttpProvider::new(
            config.provider.api_url.clone(),
            config.provider.request_timeout(),
        )?);
        let ctx = Arc::new(SyncContext::new(
            db,
            vault,
            provider,
            Arc::new(SqliteLocalStore::new()),
            config.sync.retry_policy(),
        )
        .with_lease_ttl(config.sync.lease_ttl()));
        let notifier = Notifier::from_config(&config.notifications);
        Ok(Self::new(
            ctx,
            Arc::new(notifier),
            config.provider.verify_on_connect,
        ))
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    fn audit(&self, user_id: &str, action: AuditAction, details: &str, success: bool) {
        if let Err(e) = self
            .ctx
            .db
            .insert_audit(user_id, action, Some(details), success)
        {
            warn!(user_id, error = %e, "failed to write audit entry");
        }
    }

    // -- credentials --------------------------------------------------------

    /// Store a provider token for the user, verifying it first if configured.
    pub async fn connect(&self, user_id: &str, token: &str) -> Result<(), ActionError> {
        let user_id = caller(user_id)?;
        if token.trim().is_empty() {
            return Err(ActionError::Validation("token must not be empty".into()));
        }
        let _guard = self.ctx.locks.acquire(user_id).await?;

        let result = self.connect_locked(user_id, token).await;
        match &result {
            Ok(()) => self.audit(user_id, AuditAction::Connect, "connected", true),
            Err(e) => self.audit(user_id, AuditAction::Connect, &e.to_string(), false),
        }
        result.map_err(ActionError::from)
    }

    async fn connect_locked(&self, user_id: &str, token: &str) -> Result<(), VaultError> {
        if self.verify_on_connect {
            let provider = self.ctx.provider.as_ref();
            self.ctx
                .retry
                .run("verify token", move || provider.verify_token(token))
                .await?;
        }
        self.ctx.vault.connect(user_id, token)
    }

    /// Delete the user's credential. Mappings and conflicts are kept.
    pub async fn disconnect(&self, user_id: &str) -> Result<(), ActionError> {
        let user_id = caller(user_id)?;
        let _guard = self.ctx.locks.acquire(user_id).await?;

        self.ctx.vault.disconnect(user_id)?;
        self.audit(user_id, AuditAction::Disconnect, "disconnected", true);
        Ok(())
    }

    /// Re-encrypt the user's credential with the current key.
    pub async fn rotate_tokens(&self, user_id: &str) -> Result<RotationOutcome, ActionError> {
        let user_id = caller(user_id)?;
        let _guard = self.ctx.locks.acquire(user_id).await?;

        match self.ctx.vault.rotate(user_id) {
            Ok(outcome) => {
                let details = match &outcome {
                    RotationOutcome::Rotated { from } => format!(
                        "rotated from '{}' to '{}'",
                        from,
                        self.ctx.vault.key_ring().current_id()
                    ),
                    RotationOutcome::Refreshed => "refreshed under current key".to_string(),
                };
                self.audit(user_id, AuditAction::Rotate, &details, true);
                Ok(outcome)
            }
            Err(e) => {
                self.audit(user_id, AuditAction::Rotate, &e.to_string(), false);
                Err(e.into())
            }
        }
    }

    /// Rotate every stored credential. Individual failures are reported, not
    /// fatal.
    pub fn rotate_all(&self) -> Result<Vec<RotationReport>, ActionError> {
        let reports = self.ctx.vault.rotate_all()?;
        for report in &reports {
            match &report.result {
                Ok(_) => self.audit(&report.user_id, AuditAction::Rotate, "bulk rotation", true),
                Err(e) => self.audit(&report.user_id, AuditAction::Rotate, &e.to_string(), false),
            }
        }
        Ok(reports)
    }

    // -- sync ---------------------------------------------------------------

    /// Run one sync pass for the user.
    pub async fn sync_now(&self, user_id: &str) -> Result<SyncSummary, ActionError> {
        let user_id = caller(user_id)?;
        Ok(self.engine.sync_now(user_id).await?)
    }

    /// Run a pass for every connected user, one after another.
    pub async fn sync_all_connected(
        &self,
    ) -> Result<Vec<(String, Result<SyncSummary, ActionError>)>, ActionError> {
        let users = self.ctx.db.connected_users(self.ctx.vault.provider())?;
        info!(count = users.len(), "syncing connected users");

        let mut results = Vec::with_capacity(users.len());
        for user_id in users {
            let result = self.sync_now(&user_id).await;
            results.push((user_id, result));
        }
        Ok(results)
    }

    pub fn get_status(&self, user_id: &str) -> Result<StatusReport, ActionError> {
        let user_id = caller(user_id)?;
        let connected = self.ctx.vault.is_connected(user_id)?;
        let unresolved_conflicts = self.ctx.db.count_unresolved_conflicts(user_id)?;

        let report = match self.ctx.db.get_sync_state(user_id)? {
            Some(state) => StatusReport {
                connected,
                status: state.status,
                last_sync_at: state.last_sync_at,
                last_error: state.last_error,
                unresolved_conflicts,
            },
            None => StatusReport {
                connected,
                unresolved_conflicts,
                ..StatusReport::disconnected()
            },
        };
        Ok(report)
    }

    // -- conflicts ----------------------------------------------------------

    pub fn get_conflicts(&self, user_id: &str) -> Result<Vec<ConflictRecord>, ActionError> {
        let user_id = caller(user_id)?;
        Ok(self.resolver.list(user_id)?)
    }

    pub fn get_conflict(
        &self,
        user_id: &str,
        conflict_id: &str,
    ) -> Result<ConflictRecord, ActionError> {
        let user_id = caller(user_id)?;
        Ok(self.resolver.get(user_id, conflict_id)?)
    }

    /// Resolve a conflict; `resolution` is `"local"` or `"remote"`.
    pub async fn resolve_conflict(
        &self,
        user_id: &str,
        conflict_id: &str,
        resolution: &str,
    ) -> Result<(), ActionError> {
        let user_id = caller(user_id)?;
        let resolution = Resolution::from_str_val(resolution).ok_or_else(|| {
            ActionError::Validation(format!(
                "resolution must be 'local' or 'remote', got '{}'",
                resolution
            ))
        })?;
        Ok(self.resolver.resolve(user_id, conflict_id, resolution).await?)
    }

    // -- audit --------------------------------------------------------------

    pub fn audit_log(&self, user_id: &str, limit: u32) -> Result<Vec<AuditEntry>, ActionError> {
        let user_id = caller(user_id)?;
        Ok(self.ctx.db.list_audit(user_id, limit)?)
    }
}
