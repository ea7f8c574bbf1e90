//! End-to-end tests of the log pipeline against a mock provisioner.
//!
//! The mock serves scripted Server-Sent Event streams per resource kind and
//! a resource registry, so these tests exercise the HTTP transport, the
//! per-stream readers and the supervisor together.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use provision_logs::envelope::encode_message;
use provision_logs::{
    ChannelNotifier, Color, FailureReason, HttpRegistry, LogEnvelope, LogSource, ResourceKind,
    RunScope, RunStatus, SseLogSource, StreamConfig, StreamStatus, StreamSupervisor, StyledSpan,
};
use tokio::net::TcpListener;

// =============================================================================
// Mock Provisioner
// =============================================================================

/// Scripted SSE chunks per resource kind.
#[derive(Default)]
struct MockProvisioner {
    streams: HashMap<String, Vec<String>>,
}

impl MockProvisioner {
    /// One SSE event per message.
    fn stream(mut self, kind: &str, messages: &[String]) -> Self {
        let chunks = messages.iter().map(|m| format!("data: {m}\n\n")).collect();
        self.streams.insert(kind.to_string(), chunks);
        self
    }

    /// Raw body chunks, for framing edge cases.
    fn raw_stream(mut self, kind: &str, chunks: &[&str]) -> Self {
        self.streams
            .insert(kind.to_string(), chunks.iter().map(ToString::to_string).collect());
        self
    }
}

async fn mock_logs(
    State(state): State<Arc<MockProvisioner>>,
    Path((_run_id, kind)): Path<(String, String)>,
) -> Response {
    let Some(chunks) = state.streams.get(&kind).cloned() else {
        return (StatusCode::NOT_FOUND, "unknown stream").into_response();
    };
    let body = futures::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(body),
    )
        .into_response()
}

async fn mock_resources(State(state): State<Arc<MockProvisioner>>) -> Json<Vec<String>> {
    let mut kinds: Vec<String> = state.streams.keys().cloned().collect();
    kinds.sort();
    Json(kinds)
}

/// Start the mock provisioner on a random port.
async fn start_mock_provisioner(provisioner: MockProvisioner) -> SocketAddr {
    let app = Router::new()
        .route("/runs/{run_id}/logs/{kind}", get(mock_logs))
        .route("/runs/{run_id}/resources", get(mock_resources))
        .with_state(Arc::new(provisioner));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    addr
}

fn config(addr: SocketAddr) -> StreamConfig {
    StreamConfig::default().with_endpoint(format!("http://{addr}"))
}

fn data(log: &str, completed: u64, total: u64) -> String {
    encode_message(&[LogEnvelope::Data {
        log: log.to_string(),
        created_resources: completed,
        total_resources: total,
    }])
}

fn supervisor(
    addr: SocketAddr,
    run_id: &str,
) -> (
    StreamSupervisor,
    tokio::sync::mpsc::UnboundedReceiver<provision_logs::RunFinished>,
) {
    let config = config(addr);
    let source = Arc::new(SseLogSource::new(&config).unwrap());
    let (notifier, rx) = ChannelNotifier::new();
    (
        StreamSupervisor::new(run_id, source, Arc::new(notifier), config),
        rx,
    )
}

async fn finished(supervisor: &StreamSupervisor) -> RunStatus {
    tokio::time::timeout(Duration::from_secs(10), supervisor.view().wait_finished())
        .await
        .expect("run did not finish in time")
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_sse_source_yields_event_data_in_order() {
    let addr = start_mock_provisioner(
        MockProvisioner::default().raw_stream(
            "ecr",
            &[
                ": keep-alive\r\n\r\n",
                "event: log\r\ndata: [1]\r\n\r\nda",
                "ta: [2]\n",
                "\n",
                "data: [3]\n\n",
            ],
        ),
    )
    .await;

    let source = SseLogSource::new(&config(addr)).unwrap();
    let messages = source
        .open("run-1", &ResourceKind::new("ecr"))
        .await
        .unwrap();

    let messages: Vec<String> = futures::StreamExt::collect::<Vec<_>>(messages)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(messages, vec!["[1]", "[2]", "[3]"]);
}

#[tokio::test]
async fn test_sse_source_reports_missing_stream() {
    let addr = start_mock_provisioner(MockProvisioner::default()).await;
    let source = SseLogSource::new(&config(addr)).unwrap();

    let Err(err) = source.open("run-1", &ResourceKind::new("rds")).await else {
        panic!("opening an unknown stream should fail");
    };
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn test_run_completes_from_registry_scope() {
    let addr = start_mock_provisioner(
        MockProvisioner::default()
            .stream(
                "ecr",
                &[
                    data("Creating registry ", 0, 1),
                    data("\u{1b}[3", 0, 1),
                    data("2mdone\u{1b}[0m\n", 1, 1),
                ],
            )
            .stream(
                "eks",
                &[
                    data("node 1\n", 1, 2),
                    "not json".to_string(),
                    r#"[{"Values":{"data":{"log":"missing counters"}}}]"#.to_string(),
                    data("node 2\n", 2, 2),
                ],
            ),
    )
    .await;

    let (mut supervisor, mut notifications) = supervisor(addr, "run-7");
    let registry = HttpRegistry::new(&config(addr)).unwrap();
    supervisor.start_with_registry(&registry).await.unwrap();

    assert_eq!(finished(&supervisor).await, RunStatus::Completed);
    let view = supervisor.view();

    let progress = view.progress();
    assert!(progress.ready);
    assert_eq!((progress.completed, progress.total), (3, 3));

    let spans = view.timeline_snapshot();
    assert!(spans.contains(&StyledSpan::colored("done", Color::Green)));
    let text_of = |kind: &str| -> String {
        view.timeline_entries()
            .iter()
            .filter(|entry| entry.kind.as_str() == kind)
            .map(|entry| entry.span.text.as_str())
            .collect()
    };
    assert_eq!(text_of("ecr"), "Creating registry done\n");
    assert_eq!(text_of("eks"), "node 1\nnode 2\n");

    let event = notifications.recv().await.unwrap();
    assert_eq!(event.run_id, "run-7");
    assert_eq!(event.status, RunStatus::Completed);
    assert_eq!(event.progress.percent(), Some(100));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_error_envelope_fails_run() {
    let addr = start_mock_provisioner(
        MockProvisioner::default()
            .stream("ecr", &[data("registry ready\n", 1, 1)])
            .stream(
                "eks",
                &[
                    data("Creating cluster\n", 0, 1),
                    encode_message(&[LogEnvelope::Error {
                        error_text: "quota exceeded".to_string(),
                    }]),
                    data("ignored after error\n", 1, 1),
                ],
            ),
    )
    .await;

    let (mut supervisor, mut notifications) = supervisor(addr, "run-8");
    supervisor
        .start(RunScope::Many(vec!["ecr".into(), "eks".into()]))
        .unwrap();

    assert_eq!(finished(&supervisor).await, RunStatus::Failed);
    let view = supervisor.view();

    let failure = view.failure().unwrap();
    assert_eq!(failure.kind, ResourceKind::new("eks"));
    assert_eq!(
        failure.reason,
        FailureReason::StreamError {
            error_text: "quota exceeded".to_string()
        }
    );

    let eks = view
        .streams()
        .into_iter()
        .find(|s| s.kind.as_str() == "eks")
        .unwrap();
    assert_eq!(eks.status, StreamStatus::Errored);
    assert_eq!(eks.completed, 0);

    let event = notifications.recv().await.unwrap();
    assert_eq!(event.status, RunStatus::Failed);
    assert_eq!(event.title(), "Provisioning run-8 failed on eks");

    supervisor.shutdown().await;
    assert!(!view.plain_text().contains("ignored after error"));
}

#[tokio::test]
async fn test_unknown_stream_fails_run_with_connection_lost() {
    let addr = start_mock_provisioner(
        MockProvisioner::default().stream("ecr", &[data("ok\n", 1, 1)]),
    )
    .await;

    let (mut supervisor, _notifications) = supervisor(addr, "run-9");
    supervisor
        .start(RunScope::Many(vec!["ecr".into(), "rds".into()]))
        .unwrap();

    assert_eq!(finished(&supervisor).await, RunStatus::Failed);
    let failure = supervisor.view().failure().unwrap();
    assert_eq!(failure.kind, ResourceKind::new("rds"));
    match failure.reason {
        FailureReason::ConnectionLost {
            detail: Some(detail),
        } => assert!(detail.contains("404")),
        other => panic!("unexpected failure reason: {other:?}"),
    }

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stream_ending_early_fails_run() {
    let addr = start_mock_provisioner(
        MockProvisioner::default().stream("eks", &[data("node 1 of 3\n", 1, 3)]),
    )
    .await;

    let (mut supervisor, _notifications) = supervisor(addr, "run-10");
    supervisor.start(ResourceKind::new("eks")).unwrap();

    assert_eq!(finished(&supervisor).await, RunStatus::Failed);
    let view = supervisor.view();
    assert_eq!(
        view.failure().unwrap().reason,
        FailureReason::ConnectionLost { detail: None }
    );
    assert_eq!(view.progress().percent(), Some(33));
    assert_eq!(view.plain_text(), "node 1 of 3\n");

    supervisor.shutdown().await;
}
