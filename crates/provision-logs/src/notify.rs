//! Run-finished notifications.
//!
//! When a run reaches `Completed` or `Failed` the supervisor hands a
//! [`RunFinished`] event to a [`RunFinishedNotifier`] so that whoever owns
//! the durable state (cluster list, environment status) can re-query it.
//!
//! # Configuration
//!
//! [`Notifier::from_env`] reads:
//!
//! - `PROVISION_NOTIFY_WEBHOOK_URL`: POST every event as JSON to this URL
//! - `PROVISION_NOTIFY_DISABLED`: set to "true" to disable notifications

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::progress::ProgressSnapshot;
use crate::status::{RunFailure, RunStatus};

/// Environment variable for the webhook URL.
const ENV_WEBHOOK_URL: &str = "PROVISION_NOTIFY_WEBHOOK_URL";

/// Environment variable to disable all notifications.
const ENV_NOTIFY_DISABLED: &str = "PROVISION_NOTIFY_DISABLED";

/// Emitted once per run on its first terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFinished {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    pub progress: ProgressSnapshot,
    #[serde(default = "Utc::now")]
    pub finished_at: DateTime<Utc>,
}

impl RunFinished {
    /// Short human readable summary.
    #[must_use]
    pub fn title(&self) -> String {
        match (&self.status, &self.failure) {
            (RunStatus::Failed, Some(failure)) => {
                format!("Provisioning {} failed on {}", self.run_id, failure.kind)
            }
            (status, _) => format!("Provisioning {} {status}", self.run_id),
        }
    }
}

/// Receiver of run-finished events.
#[async_trait]
pub trait RunFinishedNotifier: Send + Sync {
    /// Get the name of this notifier.
    fn name(&self) -> &'static str;

    /// Deliver the event.
    async fn on_run_finished(&self, event: &RunFinished) -> Result<()>;
}

/// POSTs events as JSON to a webhook.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Create a webhook notifier if `PROVISION_NOTIFY_WEBHOOK_URL` is set.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        match std::env::var(ENV_WEBHOOK_URL) {
            Ok(url) if !url.trim().is_empty() => Some(Self::new(url.trim())),
            _ => {
                debug!("Webhook notifications disabled ({ENV_WEBHOOK_URL} not set)");
                None
            }
        }
    }
}

#[async_trait]
impl RunFinishedNotifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn on_run_finished(&self, event: &RunFinished) -> Result<()> {
        let response = self.client.post(&self.url).json(event).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }
        debug!(run_id = %event.run_id, "Webhook notification sent");
        Ok(())
    }
}

/// Forwards events into an in-process channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<RunFinished>,
}

impl ChannelNotifier {
    /// Create the notifier and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunFinished>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RunFinishedNotifier for ChannelNotifier {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn on_run_finished(&self, event: &RunFinished) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| PipelineError::Notify("receiver dropped".to_string()))
    }
}

/// Dispatches events to every configured notifier.
pub struct Notifier {
    channels: Vec<Arc<dyn RunFinishedNotifier>>,
    disabled: bool,
}

impl Notifier {
    /// Create a notifier from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let disabled = std::env::var(ENV_NOTIFY_DISABLED)
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false);

        if disabled {
            info!("Run notifications disabled via {ENV_NOTIFY_DISABLED}");
            return Self::disabled();
        }

        let mut channels: Vec<Arc<dyn RunFinishedNotifier>> = vec![];
        if let Some(webhook) = WebhookNotifier::from_env() {
            info!("Webhook run notifications enabled");
            channels.push(Arc::new(webhook));
        }

        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier with specific channels.
    #[must_use]
    pub fn with_channels(channels: Vec<Arc<dyn RunFinishedNotifier>>) -> Self {
        Self {
            channels,
            disabled: false,
        }
    }

    /// Create a notifier that drops every event.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            channels: vec![],
            disabled: true,
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        if self.disabled {
            0
        } else {
            self.channels.len()
        }
    }

    /// Deliver to every channel and collect per-channel results.
    pub async fn notify_and_wait(&self, event: &RunFinished) -> Vec<(&'static str, Result<()>)> {
        if self.disabled {
            return vec![];
        }
        let mut results = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            results.push((channel.name(), channel.on_run_finished(event).await));
        }
        results
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl RunFinishedNotifier for Notifier {
    fn name(&self) -> &'static str {
        "notifier"
    }

    /// Errors of individual channels are logged, not returned.
    async fn on_run_finished(&self, event: &RunFinished) -> Result<()> {
        if self.disabled || self.channels.is_empty() {
            debug!(run_id = %event.run_id, "No notification channels, skipping event");
            return Ok(());
        }
        for (channel, result) in self.notify_and_wait(event).await {
            if let Err(e) = result {
                error!(channel, error = %e, "Failed to send run notification");
            }
        }
        Ok(())
    }
}

/// Deliver `event` in the background; failures are only logged.
pub fn notify_detached(notifier: Arc<dyn RunFinishedNotifier>, event: RunFinished) {
    tokio::spawn(async move {
        let name = notifier.name();
        match notifier.on_run_finished(&event).await {
            Ok(()) => debug!(notifier = name, run_id = %event.run_id, "Run notification delivered"),
            Err(e) => warn!(notifier = name, error = %e, "Run notification failed"),
        }
    });
}
