//! Supervision of the log streams of one provisioning run.
//!
//! Every resource kind gets its own connection task. The task decodes and
//! parses its messages with a [`ResourceStreamReader`] and forwards the
//! result over a bounded channel to a single aggregator task, which is the
//! only writer of the run's timeline, progress and status:
//!
//! ```text
//!  ecr ──► connection task ──┐
//!  eks ──► connection task ──┼──► aggregator ──► RunState ◄── RunView (readers)
//!  rds ──► connection task ──┘
//! ```
//!
//! Within one kind, output reaches the timeline in arrival order. Output of
//! different kinds interleaves in whatever order the aggregator receives it.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ansi::StyledSpan;
use crate::config::StreamConfig;
use crate::error::{PipelineError, Result};
use crate::notify::{notify_detached, RunFinished, RunFinishedNotifier};
use crate::progress::{ProgressSnapshot, ProgressTracker};
use crate::reader::{ReaderOutput, ResourceStreamReader};
use crate::registry::ResourceRegistry;
use crate::status::{FailureReason, RunFailure, RunStatus, StreamState, StreamStatus};
use crate::timeline::{LogTimeline, TimelineEntry, TimelineEvent};
use crate::transport::{LogSource, MessageStream};
use crate::{ResourceKind, RunScope};

/// Event sent from a connection task to the aggregator.
#[derive(Debug)]
enum StreamEvent {
    Connected(ResourceKind),
    Output {
        kind: ResourceKind,
        output: ReaderOutput,
    },
    /// The connection is gone. `error` is set when it did not end cleanly.
    Ended {
        kind: ResourceKind,
        error: Option<String>,
    },
}

/// Mutable state of a run. Only the aggregator writes it after `start`.
#[derive(Debug)]
struct RunState {
    status: RunStatus,
    timeline: LogTimeline,
    progress: ProgressTracker,
    streams: BTreeMap<ResourceKind, StreamState>,
    failure: Option<RunFailure>,
    stopped: bool,
}

struct Shared {
    run_id: String,
    state: RwLock<RunState>,
    status_tx: watch::Sender<RunStatus>,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, RunState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RunState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one event. Returns the run-finished event if the run just
    /// reached a terminal status.
    fn apply(&self, event: StreamEvent) -> Option<RunFinished> {
        let mut guard = self.write();
        let state = &mut *guard;
        if state.stopped {
            debug!(run_id = %self.run_id, "Dropping event received after stop");
            return None;
        }

        let before = state.status;
        match event {
            StreamEvent::Connected(kind) => {
                if let Some(stream) = state.streams.get_mut(&kind) {
                    if stream.status == StreamStatus::Connecting {
                        stream.status = StreamStatus::Streaming;
                    }
                }
                debug!(run_id = %self.run_id, kind = %kind, "Stream connected");
            }
            StreamEvent::Output { kind, output } => {
                state
                    .timeline
                    .append(&kind, output.spans, output.erase_previous);

                if let Some(error_text) = output.error {
                    if let Some(stream) = state.streams.get_mut(&kind) {
                        stream.status = StreamStatus::Errored;
                        stream.error_text = Some(error_text.clone());
                    }
                    fail(
                        state,
                        RunFailure {
                            kind,
                            reason: FailureReason::StreamError { error_text },
                        },
                    );
                } else if let Some(update) = output.progress {
                    let stored = state
                        .progress
                        .update(&kind, update.completed, update.total);
                    if let Some(stored) = stored {
                        if let Some(stream) = state.streams.get_mut(&kind) {
                            stream.completed = stored.completed;
                            stream.total = stored.total;
                        }
                    }
                    if state.status == RunStatus::Running && state.progress.is_complete() {
                        state.status = RunStatus::Completed;
                    }
                }
            }
            StreamEvent::Ended { kind, error } => {
                let mut errored = false;
                if let Some(stream) = state.streams.get_mut(&kind) {
                    errored = stream.status == StreamStatus::Errored;
                    if !errored {
                        stream.status = StreamStatus::Closed;
                    }
                }
                match &error {
                    Some(e) => warn!(
                        run_id = %self.run_id,
                        kind = %kind,
                        error = %e,
                        "Stream connection failed"
                    ),
                    None => debug!(run_id = %self.run_id, kind = %kind, "Stream closed"),
                }
                if !errored && !state.progress.is_kind_complete(&kind) {
                    fail(
                        state,
                        RunFailure {
                            kind,
                            reason: FailureReason::ConnectionLost { detail: error },
                        },
                    );
                }
            }
        }

        if state.status == before {
            return None;
        }
        self.status_tx.send_replace(state.status);
        if !state.status.is_terminal() {
            return None;
        }

        let progress = state.progress.snapshot();
        match &state.failure {
            Some(failure) => warn!(
                run_id = %self.run_id,
                kind = %failure.kind,
                error = %failure.message(),
                "Provisioning run failed"
            ),
            None => info!(run_id = %self.run_id, %progress, "Provisioning run completed"),
        }
        Some(RunFinished {
            run_id: self.run_id.clone(),
            status: state.status,
            failure: state.failure.clone(),
            progress,
            finished_at: Utc::now(),
        })
    }
}

/// Mark the run failed. Only the first failure of a running run counts.
fn fail(state: &mut RunState, failure: RunFailure) {
    if state.status != RunStatus::Running {
        debug!(kind = %failure.kind, "Ignoring failure of a run that already finished");
        return;
    }
    state.status = RunStatus::Failed;
    state.failure = Some(failure);
}

/// Consistent point-in-time copy of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSnapshot {
    pub run_id: String,
    pub status: RunStatus,
    pub progress: ProgressSnapshot,
    pub failure: Option<RunFailure>,
    pub streams: Vec<StreamState>,
    pub spans: Vec<StyledSpan>,
}

/// Read-only consumer handle on a run.
///
/// Cheap to clone; every accessor returns a copy, so it can be called as
/// often as needed without consuming anything.
#[derive(Clone)]
pub struct RunView {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl RunView {
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.shared.read().status
    }

    /// Aggregate progress; check `ready` before showing a percentage.
    #[must_use]
    pub fn progress(&self) -> ProgressSnapshot {
        self.shared.read().progress.snapshot()
    }

    /// First failure of the run, for the error banner.
    #[must_use]
    pub fn failure(&self) -> Option<RunFailure> {
        self.shared.read().failure.clone()
    }

    #[must_use]
    pub fn streams(&self) -> Vec<StreamState> {
        self.shared.read().streams.values().cloned().collect()
    }

    #[must_use]
    pub fn timeline_snapshot(&self) -> Vec<StyledSpan> {
        self.shared.read().timeline.snapshot()
    }

    #[must_use]
    pub fn timeline_entries(&self) -> Vec<TimelineEntry> {
        self.shared.read().timeline.entries()
    }

    #[must_use]
    pub fn plain_text(&self) -> String {
        self.shared.read().timeline.plain_text()
    }

    /// Everything at once, taken under a single lock.
    #[must_use]
    pub fn snapshot(&self) -> RunSnapshot {
        let state = self.shared.read();
        RunSnapshot {
            run_id: self.shared.run_id.clone(),
            status: state.status,
            progress: state.progress.snapshot(),
            failure: state.failure.clone(),
            streams: state.streams.values().cloned().collect(),
            spans: state.timeline.snapshot(),
        }
    }

    /// Timeline changes made after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.shared.read().timeline.subscribe()
    }

    /// Status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<RunStatus> {
        self.shared.status_tx.subscribe()
    }

    /// True once the supervisor was stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait until the run is `Completed` or `Failed`, or the supervisor is
    /// stopped. Returns the status at that point.
    pub async fn wait_finished(&self) -> RunStatus {
        let mut status = self.watch_status();
        tokio::select! {
            () = self.cancel.cancelled() => {}
            _ = status.wait_for(|s| s.is_terminal()) => {}
        }
        self.status()
    }
}

/// Owns the connections, timeline and progress of one provisioning run.
///
/// A retry is a new supervisor: nothing carries over between runs. Dropping
/// the supervisor stops it.
pub struct StreamSupervisor {
    shared: Arc<Shared>,
    source: Arc<dyn LogSource>,
    notifier: Arc<dyn RunFinishedNotifier>,
    config: StreamConfig,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl StreamSupervisor {
    pub fn new(
        run_id: impl Into<String>,
        source: Arc<dyn LogSource>,
        notifier: Arc<dyn RunFinishedNotifier>,
        config: StreamConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(RunStatus::Idle);
        let shared = Arc::new(Shared {
            run_id: run_id.into(),
            state: RwLock::new(RunState {
                status: RunStatus::Idle,
                timeline: LogTimeline::new(),
                progress: ProgressTracker::default(),
                streams: BTreeMap::new(),
                failure: None,
                stopped: false,
            }),
            status_tx,
        });

        Self {
            shared,
            source,
            notifier,
            config,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.shared.read().status
    }

    /// Consumer handle; valid for the lifetime of the run's state.
    #[must_use]
    pub fn view(&self) -> RunView {
        RunView {
            shared: Arc::clone(&self.shared),
            cancel: self.cancel.clone(),
        }
    }

    /// Open one stream per kind in `scope` and start aggregating.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// [`PipelineError::EmptyScope`] if the scope names no kind,
    /// [`PipelineError::AlreadyStarted`] if the run left `Idle` or was
    /// stopped.
    pub fn start(&mut self, scope: impl Into<RunScope>) -> Result<()> {
        let kinds = scope.into().kinds();
        if kinds.is_empty() {
            return Err(PipelineError::EmptyScope(self.shared.run_id.clone()));
        }

        {
            let mut state = self.shared.write();
            if state.status != RunStatus::Idle || state.stopped {
                return Err(PipelineError::AlreadyStarted(self.shared.run_id.clone()));
            }
            state.progress = ProgressTracker::new(kinds.iter().cloned());
            state.streams = kinds
                .iter()
                .map(|kind| (kind.clone(), StreamState::new(kind.clone())))
                .collect();
            state.status = RunStatus::Running;
        }
        self.shared.status_tx.send_replace(RunStatus::Running);

        info!(
            run_id = %self.shared.run_id,
            source = self.source.name(),
            kinds = kinds.len(),
            "Starting provisioning run"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        for kind in kinds {
            let connection = Connection {
                run_id: self.shared.run_id.clone(),
                kind,
                source: Arc::clone(&self.source),
                idle_timeout: self.config.idle_timeout(),
                tx: tx.clone(),
                cancel: self.cancel.clone(),
            };
            self.tasks.push(tokio::spawn(connection.run()));
        }
        drop(tx);

        self.tasks.push(tokio::spawn(aggregate(
            Arc::clone(&self.shared),
            rx,
            Arc::clone(&self.notifier),
            self.cancel.clone(),
        )));
        Ok(())
    }

    /// Ask `registry` for the run's kinds, then [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Registry errors, plus everything [`start`](Self::start) returns.
    pub async fn start_with_registry(&mut self, registry: &dyn ResourceRegistry) -> Result<()> {
        let kinds = registry.list_resource_kinds(&self.shared.run_id).await?;
        self.start(RunScope::Many(kinds))
    }

    /// Close every stream. Safe to call repeatedly; once it returns, no
    /// further timeline or progress change is made.
    pub fn stop(&self) {
        {
            let mut state = self.shared.write();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.cancel.cancel();
        info!(run_id = %self.shared.run_id, "Provisioning run stopped");
    }

    /// Stop and wait for every connection task to exit.
    pub async fn shutdown(&mut self) {
        self.stop();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(run_id = %self.shared.run_id, error = %e, "Stream task panicked");
            }
        }
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Single writer: applies stream events to the run state in arrival order.
async fn aggregate(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<StreamEvent>,
    notifier: Arc<dyn RunFinishedNotifier>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        if let Some(finished) = shared.apply(event) {
            notify_detached(Arc::clone(&notifier), finished);
        }
    }
    debug!(run_id = %shared.run_id, "Aggregator exited");
}

enum Next {
    Message(String),
    Failed(String),
    Ended,
    Idle(Duration),
}

/// One resource kind's stream.
struct Connection {
    run_id: String,
    kind: ResourceKind,
    source: Arc<dyn LogSource>,
    idle_timeout: Option<Duration>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl Connection {
    async fn run(self) {
        let opened = tokio::select! {
            () = self.cancel.cancelled() => return,
            opened = self.source.open(&self.run_id, &self.kind) => opened,
        };
        let mut messages = match opened {
            Ok(messages) => messages,
            Err(e) => {
                self.send(StreamEvent::Ended {
                    kind: self.kind.clone(),
                    error: Some(e.to_string()),
                })
                .await;
                return;
            }
        };

        if !self.send(StreamEvent::Connected(self.kind.clone())).await {
            return;
        }

        let mut reader = ResourceStreamReader::new(self.kind.clone());
        let error = loop {
            let next = tokio::select! {
                () = self.cancel.cancelled() => return,
                next = next_message(&mut messages, self.idle_timeout) => next,
            };
            match next {
                Next::Message(raw) => {
                    let output = reader.process_message(&raw);
                    let errored = output.errored();
                    if !output.is_empty()
                        && !self
                            .send(StreamEvent::Output {
                                kind: self.kind.clone(),
                                output,
                            })
                            .await
                    {
                        return;
                    }
                    if errored {
                        // Nothing after an error envelope is used.
                        break None;
                    }
                }
                Next::Failed(e) => break Some(e),
                Next::Ended => break None,
                Next::Idle(limit) => {
                    break Some(format!("no messages received for {}s", limit.as_secs()));
                }
            }
        };
        drop(messages);

        if !reader.is_errored() {
            let trailing = reader.finish();
            if !trailing.is_empty() {
                self.send(StreamEvent::Output {
                    kind: self.kind.clone(),
                    output: ReaderOutput {
                        spans: trailing,
                        ..ReaderOutput::default()
                    },
                })
                .await;
            }
        }

        self.send(StreamEvent::Ended {
            kind: self.kind.clone(),
            error,
        })
        .await;
    }

    /// Forward an event; false once the run is stopped or the aggregator is gone.
    async fn send(&self, event: StreamEvent) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }
}

async fn next_message(messages: &mut MessageStream, idle_timeout: Option<Duration>) -> Next {
    let item = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, messages.next()).await {
            Ok(item) => item,
            Err(_) => return Next::Idle(limit),
        },
        None => messages.next().await,
    };
    match item {
        Some(Ok(message)) => Next::Message(message),
        Some(Err(e)) => Next::Failed(e.to_string()),
        None => Next::Ended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode_message, LogEnvelope};
    use crate::notify::ChannelNotifier;
    use crate::registry::StaticRegistry;
    use crate::transport::ChannelLogSource;

    fn data(log: &str, completed: u64, total: u64) -> String {
        encode_message(&[LogEnvelope::Data {
            log: log.to_string(),
            created_resources: completed,
            total_resources: total,
        }])
    }

    fn supervisor(
        source: Arc<ChannelLogSource>,
    ) -> (StreamSupervisor, mpsc::UnboundedReceiver<RunFinished>) {
        let (notifier, rx) = ChannelNotifier::new();
        let supervisor =
            StreamSupervisor::new("run-1", source, Arc::new(notifier), StreamConfig::default());
        (supervisor, rx)
    }

    async fn wait_until(view: &RunView, predicate: impl Fn(&RunSnapshot) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !predicate(&view.snapshot()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_run_completes_when_every_kind_is_done() {
        let source = Arc::new(ChannelLogSource::new());
        let ecr = source.feed("ecr");
        let eks = source.feed("eks");
        let (mut supervisor, mut finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();

        supervisor
            .start(RunScope::Many(vec!["ecr".into(), "eks".into()]))
            .unwrap();
        assert_eq!(view.status(), RunStatus::Running);

        ecr.send(Ok(data("registry created\n", 1, 1))).unwrap();
        wait_until(&view, |s| s.progress.completed == 1).await;
        assert!(!view.progress().ready);
        assert_eq!(view.status(), RunStatus::Running);

        eks.send(Ok(data("cluster 1/2\n", 1, 2))).unwrap();
        eks.send(Ok(data("cluster 2/2\n", 2, 2))).unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Completed);
        let progress = view.progress();
        assert!(progress.ready);
        assert_eq!(progress.percent(), Some(100));
        assert!(view.failure().is_none());

        let text = view.plain_text();
        let cluster_1 = text.find("cluster 1/2").unwrap();
        let cluster_2 = text.find("cluster 2/2").unwrap();
        assert!(cluster_1 < cluster_2);
        assert!(text.contains("registry created"));

        let event = finished.recv().await.unwrap();
        assert_eq!(event.status, RunStatus::Completed);
        assert_eq!(event.run_id, "run-1");

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_error_fails_run_but_other_streams_keep_logging() {
        let source = Arc::new(ChannelLogSource::new());
        let ecr = source.feed("ecr");
        let eks = source.feed("eks");
        let (mut supervisor, mut finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor
            .start(RunScope::Many(vec!["ecr".into(), "eks".into()]))
            .unwrap();

        let batch = encode_message(&[
            LogEnvelope::Data {
                log: "a".to_string(),
                created_resources: 1,
                total_resources: 3,
            },
            LogEnvelope::Error {
                error_text: "boom".to_string(),
            },
        ]);
        ecr.send(Ok(batch)).unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Failed);
        let failure = view.failure().unwrap();
        assert_eq!(failure.kind, ResourceKind::new("ecr"));
        assert_eq!(failure.message(), "boom");

        let snapshot = view.snapshot();
        let ecr_state = snapshot
            .streams
            .iter()
            .find(|s| s.kind.as_str() == "ecr")
            .unwrap();
        assert_eq!(ecr_state.status, StreamStatus::Errored);
        assert_eq!(ecr_state.error_text.as_deref(), Some("boom"));
        assert_eq!(ecr_state.total, None);
        assert_eq!(snapshot.spans, vec![StyledSpan::plain("a")]);

        eks.send(Ok(data("still going", 1, 1))).unwrap();
        wait_until(&view, |s| s.progress.completed == 1).await;
        assert!(view.plain_text().ends_with("still going"));
        assert_eq!(view.status(), RunStatus::Failed);

        let event = finished.recv().await.unwrap();
        assert_eq!(event.status, RunStatus::Failed);
        assert!(finished.try_recv().is_err());

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_huge_counters_do_not_stall_the_run() {
        let source = Arc::new(ChannelLogSource::new());
        let ecr = source.feed("ecr");
        let eks = source.feed("eks");
        let (mut supervisor, mut finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor
            .start(RunScope::Many(vec!["ecr".into(), "eks".into()]))
            .unwrap();

        ecr.send(Ok(data("x", 0, u64::MAX))).unwrap();
        wait_until(&view, |s| s.streams.iter().any(|st| st.total == Some(u64::MAX))).await;
        eks.send(Ok(data("y", 1, 1))).unwrap();
        eks.send(Ok(data("after", 1, 1))).unwrap();
        wait_until(&view, |s| s.spans.iter().any(|span| span.text.ends_with("after"))).await;

        let progress = view.progress();
        assert!(progress.ready);
        assert_eq!(progress.total, u64::MAX);
        assert_eq!(progress.to_string(), format!("1/{} resources (0%)", u64::MAX));
        assert_eq!(view.status(), RunStatus::Running);

        ecr.send(Ok(data("", u64::MAX, u64::MAX))).unwrap();
        assert_eq!(view.wait_finished().await, RunStatus::Completed);
        assert_eq!(finished.recv().await.unwrap().progress.percent(), Some(100));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_before_completion_fails_run() {
        let source = Arc::new(ChannelLogSource::new());
        let eks = source.feed("eks");
        let (mut supervisor, _finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor.start(ResourceKind::new("eks")).unwrap();

        eks.send(Ok(data("halfway", 1, 2))).unwrap();
        drop(eks);

        assert_eq!(view.wait_finished().await, RunStatus::Failed);
        let failure = view.failure().unwrap();
        assert_eq!(failure.reason, FailureReason::ConnectionLost { detail: None });
        assert_eq!(view.streams()[0].status, StreamStatus::Closed);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_after_completion_is_clean() {
        let source = Arc::new(ChannelLogSource::new());
        let ecr = source.feed("ecr");
        let eks = source.feed("eks");
        let (mut supervisor, _finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor
            .start(RunScope::Many(vec!["ecr".into(), "eks".into()]))
            .unwrap();

        ecr.send(Ok(data("done", 2, 2))).unwrap();
        drop(ecr);
        wait_until(&view, |s| {
            s.streams
                .iter()
                .any(|st| st.kind.as_str() == "ecr" && st.status == StreamStatus::Closed)
        })
        .await;
        assert_eq!(view.status(), RunStatus::Running);

        eks.send(Ok(data("done", 1, 1))).unwrap();
        assert_eq!(view.wait_finished().await, RunStatus::Completed);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_connection_error_item_fails_run() {
        let source = Arc::new(ChannelLogSource::new());
        let eks = source.feed("eks");
        let (mut supervisor, _finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor.start(ResourceKind::new("eks")).unwrap();

        eks.send(Err(PipelineError::Connection("reset by peer".to_string())))
            .unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Failed);
        match view.failure().unwrap().reason {
            FailureReason::ConnectionLost { detail: Some(detail) } => {
                assert!(detail.contains("reset by peer"));
            }
            other => panic!("unexpected failure reason: {other:?}"),
        }

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unopenable_stream_fails_run() {
        let source = Arc::new(ChannelLogSource::new());
        let (mut supervisor, _finished) = supervisor(source);
        let view = supervisor.view();
        supervisor.start(ResourceKind::new("rds")).unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Failed);
        assert!(view.failure().unwrap().message().starts_with("rds stream lost"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_drops_in_flight_messages() {
        let source = Arc::new(ChannelLogSource::new());
        let eks = source.feed("eks");
        let (mut supervisor, mut finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        supervisor.start(ResourceKind::new("eks")).unwrap();

        eks.send(Ok(data("before stop", 1, 3))).unwrap();
        wait_until(&view, |s| s.progress.completed == 1).await;

        supervisor.stop();
        supervisor.stop();
        let _ = eks.send(Ok(data(" after stop", 3, 3)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(view.plain_text(), "before stop");
        assert_eq!(view.progress().completed, 1);
        assert_eq!(view.status(), RunStatus::Running);
        assert!(view.is_stopped());
        assert_eq!(view.wait_finished().await, RunStatus::Running);

        supervisor.shutdown().await;
        assert!(eks.is_closed());
        assert!(finished.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_rejects_empty_and_repeated_starts() {
        let source = Arc::new(ChannelLogSource::new());
        let _ecr = source.feed("ecr");
        let (mut supervisor, _finished) = supervisor(source);

        let err = supervisor.start(RunScope::Many(vec![])).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyScope(_)));
        assert_eq!(supervisor.status(), RunStatus::Idle);

        supervisor.start(ResourceKind::new("ecr")).unwrap();
        let err = supervisor.start(ResourceKind::new("ecr")).unwrap_err();
        assert!(matches!(err, PipelineError::AlreadyStarted(_)));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_with_registry() {
        let source = Arc::new(ChannelLogSource::new());
        let gke = source.feed("gke");
        let (mut supervisor, _finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();

        supervisor
            .start_with_registry(&StaticRegistry::new(["gke"]))
            .await
            .unwrap();
        gke.send(Ok(data("ok", 4, 4))).unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Completed);
        assert_eq!(view.streams()[0].kind, ResourceKind::new("gke"));
        supervisor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_closes_silent_stream() {
        let source = Arc::new(ChannelLogSource::new());
        let _eks = source.feed("eks");
        let (notifier, _rx) = ChannelNotifier::new();
        let config = StreamConfig::default().with_idle_timeout(Some(Duration::from_secs(30)));
        let mut supervisor =
            StreamSupervisor::new("run-idle", source, Arc::new(notifier), config);
        let view = supervisor.view();
        supervisor.start(ResourceKind::new("eks")).unwrap();

        assert_eq!(view.wait_finished().await, RunStatus::Failed);
        assert!(view.failure().unwrap().message().contains("no messages received for 30s"));
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_backspace_across_messages_edits_own_stream() {
        let source = Arc::new(ChannelLogSource::new());
        let eks = source.feed("eks");
        let (mut supervisor, _finished) = supervisor(Arc::clone(&source));
        let view = supervisor.view();
        let mut events = view.subscribe();
        supervisor.start(ResourceKind::new("eks")).unwrap();

        eks.send(Ok(data("50%", 0, 2))).unwrap();
        eks.send(Ok(data("\u{8}\u{8}\u{8}100%", 1, 2))).unwrap();
        wait_until(&view, |s| s.progress.completed == 1).await;

        assert_eq!(view.plain_text(), "100%");
        assert!(matches!(events.recv().await.unwrap(), TimelineEvent::Appended { .. }));
        assert_eq!(
            events.recv().await.unwrap(),
            TimelineEvent::Erased {
                kind: ResourceKind::new("eks"),
                chars: 3
            }
        );

        supervisor.shutdown().await;
    }
}
