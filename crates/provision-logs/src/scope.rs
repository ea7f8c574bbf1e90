//! Resource kinds and run scopes.

use serde::{Deserialize, Serialize};

/// Identifier of a kind of infrastructure resource being provisioned
/// (for example `ecr` or `eks`). Opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

impl ResourceKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl From<String> for ResourceKind {
    fn from(kind: String) -> Self {
        Self(kind)
    }
}

impl AsRef<str> for ResourceKind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The set of streams a run follows.
///
/// Provisioning a single resource (one cluster) and provisioning an entire
/// infrastructure stack go through the same supervisor; only the scope
/// differs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    /// One resource kind.
    Single(ResourceKind),
    /// Several resource kinds provisioned together.
    Many(Vec<ResourceKind>),
}

impl RunScope {
    /// Kinds in this scope, first occurrence order, duplicates removed.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        match self {
            Self::Single(kind) => vec![kind.clone()],
            Self::Many(kinds) => {
                let mut unique: Vec<ResourceKind> = Vec::with_capacity(kinds.len());
                for kind in kinds {
                    if !unique.contains(kind) {
                        unique.push(kind.clone());
                    }
                }
                unique
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Many(kinds) if kinds.is_empty())
    }
}

impl From<ResourceKind> for RunScope {
    fn from(kind: ResourceKind) -> Self {
        Self::Single(kind)
    }
}

impl From<Vec<ResourceKind>> for RunScope {
    fn from(kinds: Vec<ResourceKind>) -> Self {
        Self::Many(kinds)
    }
}
