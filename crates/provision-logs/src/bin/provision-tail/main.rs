//! Follow the live logs of a provisioning run in the terminal.
//!
//! Opens one stream per resource kind, prints the merged colored output and
//! shows aggregate progress until the run completes or fails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use provision_logs::{
    HttpRegistry, Notifier, ResourceKind, RunScope, RunStatus, SseLogSource, StreamConfig,
    StreamSupervisor, TimelineEvent,
};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod ui;

use ui::{LinePrinter, RunProgress};

/// Tail a provisioning run.
#[derive(Parser)]
#[command(
    name = "provision-tail",
    version,
    about = "Follow the live logs of a provisioning run",
    long_about = "Follow the live logs of a provisioning run.\n\n\
                  Streams the log output of every resource kind in the run,\n\
                  shows overall progress and exits non-zero if the run fails."
)]
struct Cli {
    /// Run to follow.
    run_id: String,

    /// Provisioner API base URL.
    #[arg(long, env = "PROVISION_STREAM_ENDPOINT")]
    endpoint: Option<String>,

    /// Resource kind to follow; repeat for several. Defaults to every kind
    /// the registry lists for the run.
    #[arg(short, long = "kind", value_name = "KIND")]
    kinds: Vec<String>,

    /// Close a stream after this many seconds without messages.
    #[arg(long, value_name = "SECS")]
    idle_timeout: Option<u64>,

    /// Print the final run snapshot as JSON.
    #[arg(long)]
    json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("info,provision_logs=debug")
    } else {
        EnvFilter::new("warn,provision_logs=warn")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = StreamConfig::from_env().context("invalid stream configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config = config.with_endpoint(endpoint);
    }
    if let Some(secs) = cli.idle_timeout {
        config = config.with_idle_timeout((secs > 0).then(|| Duration::from_secs(secs)));
    }
    config.validate()?;

    let source = Arc::new(SseLogSource::new(&config)?);
    let notifier = Arc::new(Notifier::from_env());
    let mut supervisor =
        StreamSupervisor::new(cli.run_id.clone(), source, notifier, config.clone());
    let view = supervisor.view();
    let mut events = view.subscribe();

    if cli.kinds.is_empty() {
        let registry = HttpRegistry::new(&config)?;
        supervisor
            .start_with_registry(&registry)
            .await
            .with_context(|| format!("failed to start run {}", cli.run_id))?;
    } else {
        let kinds: Vec<ResourceKind> = cli.kinds.into_iter().map(ResourceKind::new).collect();
        supervisor.start(RunScope::Many(kinds))?;
    }

    let kinds: Vec<String> = view.streams().iter().map(|s| s.kind.to_string()).collect();
    ui::print_step(&format!("Following run {} ({})", cli.run_id, kinds.join(", ")));

    let mut progress = RunProgress::new();
    let mut printer = LinePrinter::default();
    let mut status = view.watch_status();
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut interrupted = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&progress, &mut printer, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Terminal fell behind the log output");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => progress.update(&view.progress()),
            _ = status.wait_for(|s| s.is_terminal()) => break,
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
        }
    }

    supervisor.stop();
    loop {
        match events.try_recv() {
            Ok(event) => print_event(&progress, &mut printer, event),
            Err(TryRecvError::Lagged(_)) => {}
            Err(_) => break,
        }
    }
    if let Some(line) = printer.flush() {
        progress.println(line);
    }
    progress.update(&view.progress());
    progress.finish();

    let snapshot = view.snapshot();
    supervisor.shutdown().await;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }

    if interrupted {
        ui::print_warning(&format!("Stopped following run {}", snapshot.run_id));
        return Ok(());
    }

    match snapshot.status {
        RunStatus::Completed => {
            ui::print_success(&format!("Run {} completed: {}", snapshot.run_id, snapshot.progress));
            Ok(())
        }
        RunStatus::Failed => {
            let message = snapshot.failure.map_or_else(
                || "unknown failure".to_string(),
                |f| format!("{}: {}", f.kind, f.message()),
            );
            ui::print_error(&message);
            bail!("run {} failed", snapshot.run_id)
        }
        other => bail!("run {} ended while {other}", snapshot.run_id),
    }
}

fn print_event(progress: &RunProgress, printer: &mut LinePrinter, event: TimelineEvent) {
    match event {
        TimelineEvent::Appended { spans, .. } => {
            for line in printer.push(&spans) {
                progress.println(line);
            }
        }
        TimelineEvent::Erased { chars, .. } => printer.erase(chars),
    }
}
