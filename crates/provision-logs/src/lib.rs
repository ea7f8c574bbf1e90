//! Live log pipeline for infrastructure provisioning runs.
//!
//! A provisioning run creates resources of one or more kinds (a container
//! registry, a cluster, ...). The provisioner reports each kind on its own
//! log stream: a sequence of JSON messages carrying ANSI-colored log text and
//! created/total resource counters. This crate merges those streams into one
//! styled timeline, an aggregate progress figure and a run status.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use provision_logs::{Notifier, RunScope, SseLogSource, StreamConfig, StreamSupervisor};
//!
//! # async fn run() -> provision_logs::Result<()> {
//! let config = StreamConfig::from_env()?;
//! let source = Arc::new(SseLogSource::new(&config)?);
//! let mut supervisor =
//!     StreamSupervisor::new("run-42", source, Arc::new(Notifier::from_env()), config);
//!
//! supervisor.start(RunScope::Many(vec!["ecr".into(), "eks".into()]))?;
//! let view = supervisor.view();
//! let status = view.wait_finished().await;
//! println!("{status}: {}", view.progress());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`ansi`] turns raw log chunks into [`StyledSpan`]s, carrying escape
//!   state across chunk boundaries
//! - [`ResourceStreamReader`] decodes one stream's envelopes and feeds the parser
//! - [`ProgressTracker`] folds per-kind counters into a [`ProgressSnapshot`]
//! - [`LogTimeline`] holds the merged styled output
//! - [`StreamSupervisor`] owns the connections and is the single writer of
//!   all of the above; consumers read through a [`RunView`]
//! - [`LogSource`] and [`ResourceRegistry`] are the network seams

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod ansi;
pub mod config;
pub mod envelope;
pub mod error;
pub mod notify;
pub mod progress;
pub mod reader;
pub mod registry;
pub mod scope;
pub mod status;
pub mod supervisor;
pub mod timeline;
pub mod transport;

pub use ansi::{Color, Style, StyledSpan};
pub use config::StreamConfig;
pub use envelope::LogEnvelope;
pub use error::{PipelineError, Result};
pub use notify::{ChannelNotifier, Notifier, RunFinished, RunFinishedNotifier, WebhookNotifier};
pub use progress::{KindProgress, ProgressSnapshot, ProgressTracker};
pub use reader::{ProgressUpdate, ReaderOutput, ResourceStreamReader};
pub use registry::{HttpRegistry, ResourceRegistry, StaticRegistry};
pub use scope::{ResourceKind, RunScope};
pub use status::{FailureReason, RunFailure, RunStatus, StreamState, StreamStatus};
pub use supervisor::{RunSnapshot, RunView, StreamSupervisor};
pub use timeline::{LogTimeline, TimelineEntry, TimelineEvent};
pub use transport::{ChannelLogSource, LogSource, MessageStream, SseDecoder, SseLogSource};
