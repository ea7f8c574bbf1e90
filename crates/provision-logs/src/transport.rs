//! Network side of the pipeline.
//!
//! A [`LogSource`] opens one stream per resource kind and yields the raw
//! wire messages (JSON arrays, see [`crate::envelope`]). The production
//! source speaks Server-Sent Events over HTTP; [`ChannelLogSource`] feeds
//! messages from in-process channels.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::StreamConfig;
use crate::error::{PipelineError, Result};
use crate::ResourceKind;

/// Raw messages of one open stream. The stream ends when the connection
/// closes; an `Err` item reports a broken connection.
pub type MessageStream = BoxStream<'static, Result<String>>;

/// Opens log streams for resource kinds.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Open the log stream of `kind` within run `run_id`.
    async fn open(&self, run_id: &str, kind: &ResourceKind) -> Result<MessageStream>;
}

/// Log streams served as Server-Sent Events.
///
/// `GET {endpoint}/runs/{run_id}/logs/{kind}`; the `data` of every event is
/// one wire message.
pub struct SseLogSource {
    client: reqwest::Client,
    base_url: String,
}

impl SseLogSource {
    /// Create a source from the pipeline config.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Http`] if the HTTP client cannot be built.
    pub fn new(config: &StreamConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(client, config.base_url()))
    }

    /// Create a source with an existing client.
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// URL of the stream for `kind`.
    #[must_use]
    pub fn stream_url(&self, run_id: &str, kind: &ResourceKind) -> String {
        format!("{}/runs/{run_id}/logs/{kind}", self.base_url)
    }
}

#[async_trait]
impl LogSource for SseLogSource {
    fn name(&self) -> &'static str {
        "sse"
    }

    async fn open(&self, run_id: &str, kind: &ResourceKind) -> Result<MessageStream> {
        let url = self.stream_url(run_id, kind);
        debug!(url = %url, "Opening log stream");

        let response = self
            .client
            .get(&url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                url,
                status: status.as_u16(),
            });
        }
        info!(kind = %kind, "Log stream connected");

        let body = response.bytes_stream().boxed();
        let state = SseReadState {
            body,
            decoder: SseDecoder::default(),
            ready: VecDeque::new(),
            done: false,
        };

        let messages = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(message) = state.ready.pop_front() {
                    return Some((Ok(message), state));
                }
                if state.done {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        let decoded = state.decoder.push(&chunk);
                        state.ready.extend(decoded);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(PipelineError::Http(e)), state));
                    }
                    None => {
                        state.done = true;
                        state.ready.extend(state.decoder.finish());
                    }
                }
            }
        });

        Ok(messages.boxed())
    }
}

struct SseReadState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    done: bool,
}

/// Incremental Server-Sent Events decoder.
///
/// Bytes are buffered until a blank line ends an event, so a multi-byte
/// character or an event split across network reads decodes correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already searched for a blank line.
    scanned: usize,
}

impl SseDecoder {
    /// Feed bytes and return the `data` of every event they complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        // A blank line may straddle the previous push, so back up one byte.
        let mut from = self.scanned.saturating_sub(1);
        while let Some(end) = find_blank_line(&self.buffer, from) {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            if let Some(data) = event_data(&block[..end]) {
                events.push(data);
            }
            from = 0;
        }
        self.scanned = self.buffer.len();
        events
    }

    /// Decode whatever is left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        let block = std::mem::take(&mut self.buffer);
        event_data(&block)
    }
}

/// Offset of the first `\n\n` starting at or after `from`.
fn find_blank_line(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| pos + from)
}

/// Join the `data:` lines of one event block.
fn event_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut data: Option<String> = None;
    for line in text.lines() {
        let Some(value) = line.strip_prefix("data:") else {
            // Comments, `event:`, `id:` and `retry:` carry nothing for us.
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        match data.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data.filter(|d| !d.is_empty())
}

/// In-process log source fed through channels.
///
/// Register a feed per kind with [`ChannelLogSource::feed`] before the run
/// opens it; dropping the sender closes the stream.
#[derive(Default)]
pub struct ChannelLogSource {
    feeds: Mutex<HashMap<ResourceKind, mpsc::UnboundedReceiver<Result<String>>>>,
}

impl ChannelLogSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the feed for `kind` and return its sending side.
    pub fn feed(&self, kind: impl Into<ResourceKind>) -> mpsc::UnboundedSender<Result<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(kind.into(), rx);
        tx
    }
}

#[async_trait]
impl LogSource for ChannelLogSource {
    fn name(&self) -> &'static str {
        "channel"
    }

    async fn open(&self, _run_id: &str, kind: &ResourceKind) -> Result<MessageStream> {
        let rx = self
            .feeds
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(kind)
            .ok_or_else(|| PipelineError::Connection(format!("no feed registered for {kind}")))?;

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}
