//! ANSI SGR parsing for provisioning log output.
//!
//! Provisioners (Terraform, Helm, cloud CLIs) write colored terminal output.
//! [`parse`] turns a raw chunk into [`StyledSpan`]s. The parser keeps no
//! hidden state: everything it needs to continue with the next chunk of the
//! same stream lives in the [`ParserState`] it hands back, so an escape
//! sequence split across two network messages parses exactly like one that
//! arrived whole.
//!
//! Supported SGR codes:
//!
//! | Code        | Effect                     |
//! |-------------|----------------------------|
//! | `0` / empty | reset all attributes       |
//! | `1` `3` `4` | bold / italic / underline  |
//! | `22` `23` `24` | clear bold / italic / underline |
//! | `30`–`37`   | foreground color           |
//! | `39`        | default foreground         |
//! | `40`–`47`   | background color           |
//! | `49`        | default background         |
//! | `90`        | grey foreground            |
//!
//! Unknown codes are ignored. Other CSI sequences (cursor movement, erase
//! line) are dropped.

use serde::{Deserialize, Serialize};

const ESC: char = '\x1b';
const BACKSPACE: char = '\u{8}';

/// Named terminal color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Black,
    Red,
    Green,
    Yellow,
    Blue,
    Magenta,
    Cyan,
    White,
    /// Only reachable as a foreground (code 90).
    Grey,
}

impl Color {
    /// Standard 8-color palette in SGR order.
    const PALETTE: [Self; 8] = [
        Self::Black,
        Self::Red,
        Self::Green,
        Self::Yellow,
        Self::Blue,
        Self::Magenta,
        Self::Cyan,
        Self::White,
    ];

    fn from_offset(offset: u16) -> Option<Self> {
        Self::PALETTE.get(usize::from(offset)).copied()
    }

    /// Lowercase color name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Black => "black",
            Self::Red => "red",
            Self::Green => "green",
            Self::Yellow => "yellow",
            Self::Blue => "blue",
            Self::Magenta => "magenta",
            Self::Cyan => "cyan",
            Self::White => "white",
            Self::Grey => "grey",
        }
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rendering attributes shared by a run of text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Style {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground: Option<Color>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<Color>,
    #[serde(default)]
    pub bold: bool,
    #[serde(default)]
    pub italic: bool,
    #[serde(default)]
    pub underline: bool,
}

impl Style {
    /// True when no attribute is set.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        *self == Self::default()
    }

    /// Apply one SGR parameter. `None` is an empty parameter (`ESC[m`).
    fn apply_sgr(&mut self, code: Option<u16>) {
        match code {
            None | Some(0) => *self = Self::default(),
            Some(1) => self.bold = true,
            Some(3) => self.italic = true,
            Some(4) => self.underline = true,
            Some(22) => self.bold = false,
            Some(23) => self.italic = false,
            Some(24) => self.underline = false,
            Some(n @ 30..=37) => self.foreground = Color::from_offset(n - 30),
            Some(39) => self.foreground = None,
            Some(n @ 40..=47) => self.background = Color::from_offset(n - 40),
            Some(49) => self.background = None,
            Some(90) => self.foreground = Some(Color::Grey),
            Some(_) => {}
        }
    }
}

/// A run of text rendered with a single [`Style`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyledSpan {
    pub text: String,
    #[serde(flatten)]
    pub style: Style,
}

impl StyledSpan {
    /// Create a span with the given style.
    pub fn new(text: impl Into<String>, style: Style) -> Self {
        Self {
            text: text.into(),
            style,
        }
    }

    /// Create an unstyled span.
    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, Style::default())
    }

    /// Create a span with only a foreground color.
    pub fn colored(text: impl Into<String>, foreground: Color) -> Self {
        Self::new(
            text,
            Style {
                foreground: Some(foreground),
                ..Style::default()
            },
        )
    }
}

/// Scanner position inside an escape sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    EscapeSeen,
    ReadingParams,
}

/// Running parser state for one log stream.
///
/// Feed the state returned by one [`parse`] call into the next call for the
/// same stream. A fresh stream starts from [`ParserState::default`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserState {
    mode: Mode,
    style: Style,
    /// Raw characters of the escape sequence in progress, ESC included.
    pending: String,
    /// Parameter currently being read.
    param: String,
    /// Parameters already terminated by `;`.
    params: Vec<String>,
    /// Text not yet emitted as a span.
    text: String,
}

impl ParserState {
    /// Style that will apply to the next emitted text.
    #[must_use]
    pub fn style(&self) -> Style {
        self.style
    }

    /// True while an escape sequence is only partially received.
    #[must_use]
    pub fn in_escape(&self) -> bool {
        self.mode != Mode::Normal
    }

    fn flush_text(&mut self, spans: &mut Vec<StyledSpan>) {
        if !self.text.is_empty() {
            spans.push(StyledSpan::new(std::mem::take(&mut self.text), self.style));
        }
    }

    fn reset_sequence(&mut self) {
        self.mode = Mode::Normal;
        self.pending.clear();
        self.param.clear();
        self.params.clear();
    }

    fn step(&mut self, c: char, out: &mut Parsed) {
        match self.mode {
            Mode::Normal => match c {
                ESC => {
                    self.mode = Mode::EscapeSeen;
                    self.pending.push(c);
                }
                BACKSPACE => self.erase_one(out),
                _ => self.text.push(c),
            },
            Mode::EscapeSeen => {
                if c == '[' {
                    self.flush_text(&mut out.spans);
                    self.mode = Mode::ReadingParams;
                    self.pending.push(c);
                } else {
                    // Not a CSI: keep both characters as text.
                    self.text.push(ESC);
                    self.text.push(c);
                    self.reset_sequence();
                }
            }
            Mode::ReadingParams => match c {
                ';' => {
                    self.pending.push(c);
                    self.params.push(std::mem::take(&mut self.param));
                }
                'm' => {
                    self.params.push(std::mem::take(&mut self.param));
                    for param in std::mem::take(&mut self.params) {
                        self.style.apply_sgr(parse_sgr_code(&param));
                    }
                    self.reset_sequence();
                }
                '@'..='~' => self.reset_sequence(),
                ESC => {
                    self.reset_sequence();
                    self.mode = Mode::EscapeSeen;
                    self.pending.push(c);
                }
                ' '..='?' => {
                    self.pending.push(c);
                    self.param.push(c);
                }
                _ => {
                    // Malformed sequence: surface what was read as text.
                    let raw = std::mem::take(&mut self.pending);
                    self.reset_sequence();
                    self.text.push_str(&raw);
                    self.step(c, out);
                }
            },
        }
    }

    fn erase_one(&mut self, out: &mut Parsed) {
        if self.text.pop().is_some() {
            return;
        }
        match out.spans.last_mut() {
            Some(last) => {
                last.text.pop();
                if last.text.is_empty() {
                    out.spans.pop();
                }
            }
            None => out.erase_previous += 1,
        }
    }
}

/// Result of parsing one chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parsed {
    /// Spans completed by this chunk, in order.
    pub spans: Vec<StyledSpan>,
    /// Backspaces that reached past this chunk's own text. The caller removes
    /// this many characters from the stream's previously emitted output.
    pub erase_previous: usize,
}

impl Parsed {
    /// Concatenated text of all spans.
    #[must_use]
    pub fn text(&self) -> String {
        self.spans.iter().map(|s| s.text.as_str()).collect()
    }
}

fn parse_sgr_code(param: &str) -> Option<u16> {
    if param.is_empty() {
        return None;
    }
    // Unparseable parameters map to a code no branch matches.
    Some(param.parse().unwrap_or(u16::MAX))
}

/// Parse one chunk of a stream, continuing from `state`.
///
/// Buffered text is emitted at the end of the chunk; an escape sequence that
/// is cut off stays inside the returned state and completes on the next call.
#[must_use]
pub fn parse(chunk: &str, mut state: ParserState) -> (Parsed, ParserState) {
    let mut out = Parsed::default();
    for c in chunk.chars() {
        state.step(c, &mut out);
    }
    state.flush_text(&mut out.spans);
    (out, state)
}

/// Flush a stream that has ended: an incomplete escape becomes literal text.
#[must_use]
pub fn finish(mut state: ParserState) -> Vec<StyledSpan> {
    let mut spans = Vec::new();
    if state.in_escape() {
        let raw = std::mem::take(&mut state.pending);
        state.reset_sequence();
        state.text.push_str(&raw);
    }
    state.flush_text(&mut spans);
    spans
}

/// Parse a complete string in one go.
#[must_use]
pub fn parse_all(input: &str) -> Vec<StyledSpan> {
    let (parsed, state) = parse(input, ParserState::default());
    let mut spans = parsed.spans;
    spans.extend(finish(state));
    coalesce(spans)
}

/// Plain text of `input` with escape sequences removed and backspaces applied.
#[must_use]
pub fn strip_ansi(input: &str) -> String {
    parse_all(input).into_iter().map(|s| s.text).collect()
}

/// Merge adjacent spans that share a style.
#[must_use]
pub fn coalesce(spans: impl IntoIterator<Item = StyledSpan>) -> Vec<StyledSpan> {
    let mut merged: Vec<StyledSpan> = Vec::new();
    for span in spans {
        if span.text.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if last.style == span.style => last.text.push_str(&span.text),
            _ => merged.push(span),
        }
    }
    merged
}
