//! Pipeline configuration.
//!
//! Values come from environment variables, falling back to defaults:
//!
//! - `PROVISION_STREAM_ENDPOINT`: base URL of the provisioner API
//! - `PROVISION_STREAM_CHANNEL_CAPACITY`: fan-in queue size between
//!   connections and the aggregator
//! - `PROVISION_STREAM_CONNECT_TIMEOUT_SECS`: timeout for opening a stream
//! - `PROVISION_STREAM_IDLE_TIMEOUT_SECS`: close a stream that stays silent
//!   this long (unset or `0` disables it)

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};

const ENV_ENDPOINT: &str = "PROVISION_STREAM_ENDPOINT";
const ENV_CHANNEL_CAPACITY: &str = "PROVISION_STREAM_CHANNEL_CAPACITY";
const ENV_CONNECT_TIMEOUT: &str = "PROVISION_STREAM_CONNECT_TIMEOUT_SECS";
const ENV_IDLE_TIMEOUT: &str = "PROVISION_STREAM_IDLE_TIMEOUT_SECS";

const DEFAULT_ENDPOINT: &str = "http://localhost:8080/api";
const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Settings shared by the transport, registry and supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Base URL; streams live under `{endpoint}/runs/{run_id}/logs/{kind}`.
    pub endpoint: String,
    /// Bound of the fan-in channel feeding the aggregator.
    pub channel_capacity: usize,
    /// Timeout for establishing one stream connection.
    pub connect_timeout_secs: u64,
    /// Idle timeout per stream; `None` keeps connections open indefinitely.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: None,
        }
    }
}

impl StreamConfig {
    /// Build a config from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a numeric variable does not
    /// parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] when a numeric value does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.trim().is_empty()) {
            config.endpoint = endpoint.trim().to_string();
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, ENV_CHANNEL_CAPACITY)? {
            config.channel_capacity = capacity;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CONNECT_TIMEOUT)? {
            config.connect_timeout_secs = secs;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_IDLE_TIMEOUT)? {
            config.idle_timeout_secs = (secs > 0).then_some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Override the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Override the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout_secs = idle.map(|d| d.as_secs().max(1));
        self
    }

    /// Check invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an empty endpoint or a zero
    /// channel capacity.
    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(PipelineError::Config("endpoint must not be empty".to_string()));
        }
        if self.channel_capacity == 0 {
            warn!("Channel capacity of 0 requested");
            return Err(PipelineError::Config(
                "channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Endpoint without a trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| PipelineError::Config(format!("{key} must be a number, got {raw:?}"))),
    }
}
