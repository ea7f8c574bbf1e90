//! Run and stream status types.

use serde::{Deserialize, Serialize};

use crate::ResourceKind;

/// Lifecycle of a provisioning run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, streams not opened yet
    Idle,
    /// Streams open, waiting for completion
    Running,
    /// Every resource of every kind was created
    Completed,
    /// A stream reported an error or ended before its resources were created
    Failed,
}

impl RunStatus {
    /// `Completed` and `Failed` are final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status of one resource kind's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Connecting,
    Streaming,
    /// The provisioner reported an error on this stream.
    Errored,
    Closed,
}

/// Per-kind view combining connection status and counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamState {
    pub kind: ResourceKind,
    pub status: StreamStatus,
    pub completed: u64,
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl StreamState {
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            status: StreamStatus::Connecting,
            completed: 0,
            total: None,
            error_text: None,
        }
    }

    /// True once every resource of this kind was created.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.completed == total)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureReason {
    /// The provisioner sent an error envelope.
    StreamError { error_text: String },
    /// The connection ended before the kind's resources were all created.
    ConnectionLost {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// First failure observed in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: ResourceKind,
    pub reason: FailureReason,
}

impl RunFailure {
    /// Text suitable for an error banner.
    #[must_use]
    pub fn message(&self) -> String {
        match &self.reason {
            FailureReason::StreamError { error_text } => error_text.clone(),
            FailureReason::ConnectionLost { detail: Some(detail) } => {
                format!("{} stream lost before provisioning finished: {detail}", self.kind)
            }
            FailureReason::ConnectionLost { detail: None } => {
                format!("{} stream closed before provisioning finished", self.kind)
            }
        }
    }
}
