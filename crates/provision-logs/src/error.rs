//! Error types for the provisioning log pipeline.

use thiserror::Error;

/// Errors surfaced by the pipeline's fallible operations.
///
/// Bad telemetry (malformed envelopes, inconsistent counters) is never an
/// error here: it is discarded or clamped where it is observed.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Remote endpoint answered with a non-success status
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// A log stream could not be opened or broke
    #[error("Stream connection failed: {0}")]
    Connection(String),

    /// `start` called on a supervisor that already left `Idle`
    #[error("Run {0} was already started")]
    AlreadyStarted(String),

    /// A run needs at least one resource kind
    #[error("Run {0} has no resource kinds to provision")]
    EmptyScope(String),

    /// The resource registry could not produce the kinds for a run
    #[error("Resource registry error: {0}")]
    Registry(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Run-finished notification could not be delivered
    #[error("Notification failed: {0}")]
    Notify(String),
}

/// Convenience alias used across the crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
