//! Slack webhook observer.
//!
//! Posts a short message to an incoming webhook when a pass changed
//! something or failed. Delivery runs on a spawned task so the caller is
//! never blocked on Slack.

use tracing::{debug, info, warn};

use super::SyncObserver;
use crate::errors::NotificationError;
use crate::models::SyncOutcome;

/// Slack incoming-webhook observer.
#[derive(Clone)]
pub struct SlackObserver {
    webhook_url: String,
    http: reqwest::Client,
}

impl SlackObserver {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// Post `message` as a plain `text` payload.
    pub async fn send_message(&self, message: &str) -> Result<(), NotificationError> {
        debug!(len = message.len(), "sending Slack message");

        let payload = serde_json::json!({
            "text": message,
            "unfurl_links": false,
            "unfurl_media": false,
        });

        let resp = self.http.post(&self.webhook_url).json(&payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Slack webhook returned error");
            return Err(NotificationError::SlackError(format!(
                "HTTP {}: {}",
                status, body
            )));
        }

        info!("Slack message sent");
        Ok(())
    }
}

/// Message for an outcome, or `None` if the pass is not worth reporting.
fn format_outcome(user_id: &str, outcome: &SyncOutcome) -> Option<String> {
    if let Some(error) = &outcome.error {
        let mut msg = format!(":x: *TaskSync failed for `{}`*\n```{}```", user_id, error);
        if outcome.requires_reconnect {
            msg.push_str("\nThe provider rejected the token; reconnect required.");
        }
        return Some(msg);
    }

    let summary = &outcome.summary;
    if !summary.has_activity() {
        return None;
    }
    let mut msg = format!(
        ":white_check_mark: *TaskSync pass for `{}`*\n\
         - Pulled: {}\n\
         - Pushed: {}\n\
         - Converged: {}",
        user_id,
        summary.pulled(),
        summary.pushed(),
        summary.converged,
    );
    if summary.conflicts > 0 {
        msg.push_str(&format!(
            "\n- :warning: Conflicts: {} (resolve with `tasksync resolve`)",
            summary.conflicts
        ));
    }
    if summary.failed > 0 {
        msg.push_str(&format!("\n- Failed pushes: {}", summary.failed));
    }
    Some(msg)
}

impl SyncObserver for SlackObserver {
    fn on_sync_completed(&self, user_id: &str, outcome: &SyncOutcome) {
        let Some(message) = format_outcome(user_id, outcome) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, dropping Slack notification");
            return;
        };
        let this = self.clone();
        handle.spawn(async move {
            if let Err(e) = this.send_message(&message).await {
                warn!(error = %e, "Slack notification failed");
            }
        });
    }
}
