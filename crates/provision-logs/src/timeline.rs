//! Append-only styled log of a provisioning run.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ansi::StyledSpan;
use crate::ResourceKind;

/// Default capacity of the subscription channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// A span together with the stream that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub kind: ResourceKind,
    pub span: StyledSpan,
}

/// Change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEvent {
    /// Spans appended at the end of the timeline.
    Appended {
        kind: ResourceKind,
        spans: Vec<StyledSpan>,
    },
    /// Characters removed from the end of the most recent entry.
    Erased { kind: ResourceKind, chars: usize },
}

/// Ordered styled output of every stream in a run.
///
/// Entries are only ever added at the end. The one exception to "never
/// modified" is a backspace arriving in a later chunk of the same stream: it
/// shortens the last entry, and only while that entry is still the newest in
/// the timeline and belongs to the same stream.
#[derive(Debug)]
pub struct LogTimeline {
    entries: Vec<TimelineEntry>,
    events: broadcast::Sender<TimelineEvent>,
}

impl Default for LogTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl LogTimeline {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a timeline whose subscribers buffer up to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            entries: Vec::new(),
            events,
        }
    }

    /// Append a stream's output.
    ///
    /// `erase_previous` characters are first removed from the newest entries,
    /// walking back while they belong to `kind`; whatever is left once another
    /// stream's entry is reached is dropped. A span with the same stream and
    /// style as the newest entry extends it.
    pub fn append(&mut self, kind: &ResourceKind, spans: Vec<StyledSpan>, erase_previous: usize) {
        if erase_previous > 0 {
            let erased = self.erase_tail(kind, erase_previous);
            if erased > 0 {
                let _ = self.events.send(TimelineEvent::Erased {
                    kind: kind.clone(),
                    chars: erased,
                });
            }
        }

        let spans: Vec<StyledSpan> = spans.into_iter().filter(|s| !s.text.is_empty()).collect();
        if spans.is_empty() {
            return;
        }

        for span in &spans {
            match self.entries.last_mut() {
                Some(last) if last.kind == *kind && last.span.style == span.style => {
                    last.span.text.push_str(&span.text);
                }
                _ => self.entries.push(TimelineEntry {
                    kind: kind.clone(),
                    span: span.clone(),
                }),
            }
        }

        // No receivers is not an error.
        let _ = self.events.send(TimelineEvent::Appended {
            kind: kind.clone(),
            spans,
        });
    }

    fn erase_tail(&mut self, kind: &ResourceKind, chars: usize) -> usize {
        let mut erased = 0;
        while erased < chars {
            let Some(last) = self.entries.last_mut() else {
                break;
            };
            if last.kind != *kind {
                break;
            }
            while erased < chars && last.span.text.pop().is_some() {
                erased += 1;
            }
            if last.span.text.is_empty() {
                self.entries.pop();
            }
        }
        erased
    }

    /// Copy of every span, in order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<StyledSpan> {
        self.entries.iter().map(|e| e.span.clone()).collect()
    }

    /// Copy of every entry with its stream.
    #[must_use]
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.entries.clone()
    }

    /// Text of the timeline without styling.
    #[must_use]
    pub fn plain_text(&self) -> String {
        self.entries.iter().map(|e| e.span.text.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Receive every change made after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }
}
