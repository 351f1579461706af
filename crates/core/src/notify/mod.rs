//! Sync completion notifications.
//!
//! The orchestrator reports every finished pass, successful or not, to a
//! single [`SyncObserver`] after it has released the user's lock. The
//! [`Notifier`] fans one report out to any number of observers; a failing
//! observer never affects the pass or the other observers.

pub mod slack;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::models::SyncOutcome;

pub use slack::SlackObserver;

/// Receives the outcome of each sync pass.
pub trait SyncObserver: Send + Sync {
    fn on_sync_completed(&self, user_id: &str, outcome: &SyncOutcome);
}

/// Writes each outcome to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SyncObserver for LogObserver {
    fn on_sync_completed(&self, user_id: &str, outcome: &SyncOutcome) {
        match &outcome.error {
            None => info!(user_id, summary = %outcome.summary, "sync completed"),
            Some(error) => warn!(
                user_id,
                error = %error,
                requires_reconnect = outcome.requires_reconnect,
                completed = ?outcome.summary.completed_types,
                "sync failed"
            ),
        }
    }
}

/// Fan-out to every registered observer.
#[derive(Default, Clone)]
pub struct Notifier {
    observers: Vec<Arc<dyn SyncObserver>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log observer plus any channel enabled in the configuration.
    pub fn from_config(config: &NotificationConfig) -> Self {
        let mut notifier = Self::new().with(Arc::new(LogObserver));
        if let Some(url) = &config.slack_webhook_url {
            info!("Slack notifications enabled");
            notifier = notifier.with(Arc::new(SlackObserver::new(url.clone())));
        }
        notifier
    }

    pub fn with(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl SyncObserver for Notifier {
    fn on_sync_completed(&self, user_id: &str, outcome: &SyncOutcome) {
        for observer in &self.observers {
            observer.on_sync_completed(user_id, outcome);
        }
    }
}
