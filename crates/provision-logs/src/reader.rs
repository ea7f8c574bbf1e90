//! Per-stream message processing.
//!
//! A [`ResourceStreamReader`] owns everything that is private to one
//! resource kind's log feed: the ANSI parser state and whether the stream
//! has already reported an error. It is driven by the connection task for
//! that stream, so its output is always in that stream's arrival order.

use tracing::{debug, warn};

use crate::ansi::{self, ParserState, StyledSpan};
use crate::envelope::{decode_message, LogEnvelope};
use crate::ResourceKind;

/// Progress counters carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub completed: u64,
    pub total: u64,
}

/// What one network message contributed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderOutput {
    /// Parsed log text of every valid data envelope, in batch order.
    pub spans: Vec<StyledSpan>,
    /// Characters to erase from this stream's previously emitted text.
    pub erase_previous: usize,
    /// Counters of the last valid data envelope; `None` if there was none or
    /// the message carried an error.
    pub progress: Option<ProgressUpdate>,
    /// Text of the error envelope, if the stream failed in this message.
    pub error: Option<String>,
}

impl ReaderOutput {
    #[must_use]
    pub fn errored(&self) -> bool {
        self.error.is_some()
    }

    /// True when the message changed nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
            && self.erase_previous == 0
            && self.progress.is_none()
            && self.error.is_none()
    }
}

/// Decoder and parser state for one resource kind's log stream.
#[derive(Debug)]
pub struct ResourceStreamReader {
    kind: ResourceKind,
    parser: ParserState,
    errored: bool,
}

impl ResourceStreamReader {
    #[must_use]
    pub fn new(kind: ResourceKind) -> Self {
        Self {
            kind,
            parser: ParserState::default(),
            errored: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    /// True once an error envelope was seen; later messages are ignored.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.errored
    }

    /// Process one raw network message.
    pub fn process_message(&mut self, message: &str) -> ReaderOutput {
        if self.errored {
            debug!(kind = %self.kind, "Ignoring message on errored stream");
            return ReaderOutput::default();
        }
        let envelopes = decode_message(message);
        self.process_envelopes(envelopes)
    }

    /// Process already-decoded envelopes of one message.
    pub fn process_envelopes(&mut self, envelopes: Vec<LogEnvelope>) -> ReaderOutput {
        let mut output = ReaderOutput::default();
        if self.errored {
            return output;
        }

        let mut text = String::new();
        let mut last_counters = None;

        for envelope in envelopes {
            match envelope {
                LogEnvelope::Data {
                    log,
                    created_resources,
                    total_resources,
                } => {
                    text.push_str(&log);
                    last_counters = Some(ProgressUpdate {
                        completed: created_resources,
                        total: total_resources,
                    });
                }
                LogEnvelope::Error { error_text } => {
                    warn!(
                        kind = %self.kind,
                        error = %error_text,
                        "Provisioning stream reported an error"
                    );
                    self.errored = true;
                    output.error = Some(error_text);
                    break;
                }
            }
        }

        if !text.is_empty() {
            let (parsed, state) = ansi::parse(&text, std::mem::take(&mut self.parser));
            self.parser = state;
            output.spans = parsed.spans;
            output.erase_previous = parsed.erase_previous;
        }

        if output.error.is_none() {
            output.progress = last_counters;
        }
        output
    }

    /// Flush the parser when the stream ends.
    pub fn finish(&mut self) -> Vec<StyledSpan> {
        ansi::finish(std::mem::take(&mut self.parser))
    }
}
