//! Source of the resource kinds a run provisions.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{PipelineError, Result};
use crate::ResourceKind;

/// Read-only view of the durable resource registry.
#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    /// Resource kinds provisioned by `run_id`.
    async fn list_resource_kinds(&self, run_id: &str) -> Result<Vec<ResourceKind>>;
}

/// Fixed list of kinds, for runs whose scope is known by the caller.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    kinds: Vec<ResourceKind>,
}

impl StaticRegistry {
    pub fn new(kinds: impl IntoIterator<Item = impl Into<ResourceKind>>) -> Self {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ResourceRegistry for StaticRegistry {
    async fn list_resource_kinds(&self, _run_id: &str) -> Result<Vec<ResourceKind>> {
        Ok(self.kinds.clone())
    }
}

/// Registry entries come back either as bare strings or as objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegistryEntry {
    Kind(String),
    Resource { kind: String },
}

impl From<RegistryEntry> for ResourceKind {
    fn from(entry: RegistryEntry) -> Self {
        match entry {
            RegistryEntry::Kind(kind) | RegistryEntry::Resource { kind } => Self::new(kind),
        }
    }
}

/// Registry served by the provisioner API: `GET {endpoint}/runs/{run_id}/resources`.
pub struct HttpRegistry {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRegistry {
    /// # Errors
    ///
    /// Returns [`PipelineError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
        })
    }
}

#[async_trait]
impl ResourceRegistry for HttpRegistry {
    async fn list_resource_kinds(&self, run_id: &str) -> Result<Vec<ResourceKind>> {
        let url = format!("{}/runs/{run_id}/resources", self.base_url);
        debug!(url = %url, "Listing resource kinds");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let entries: Vec<RegistryEntry> = serde_json::from_str(&body)
            .map_err(|e| PipelineError::Registry(format!("unexpected registry response: {e}")))?;
        Ok(entries.into_iter().map(ResourceKind::from).collect())
    }
}
