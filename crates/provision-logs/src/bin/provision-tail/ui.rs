//! Console rendering for provision-tail.

use std::time::Duration;

use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use provision_logs::{Color, ProgressSnapshot, StyledSpan};

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

const fn terminal_color(color: Color) -> colored::Color {
    match color {
        Color::Black => colored::Color::Black,
        Color::Red => colored::Color::Red,
        Color::Green => colored::Color::Green,
        Color::Yellow => colored::Color::Yellow,
        Color::Blue => colored::Color::Blue,
        Color::Magenta => colored::Color::Magenta,
        Color::Cyan => colored::Color::Cyan,
        Color::White => colored::Color::White,
        Color::Grey => colored::Color::BrightBlack,
    }
}

/// Re-apply a span's style for the local terminal.
pub fn render_span(span: &StyledSpan) -> ColoredString {
    let mut text = span.text.as_str().normal();
    if let Some(fg) = span.style.foreground {
        text = text.color(terminal_color(fg));
    }
    if let Some(bg) = span.style.background {
        text = text.on_color(terminal_color(bg));
    }
    if span.style.bold {
        text = text.bold();
    }
    if span.style.italic {
        text = text.italic();
    }
    if span.style.underline {
        text = text.underline();
    }
    text
}

/// Collects timeline output into whole lines so log text can be printed
/// above the progress bar.
#[derive(Debug, Default)]
pub struct LinePrinter {
    pending: Vec<StyledSpan>,
}

impl LinePrinter {
    /// Add spans; returns every line they completed.
    pub fn push(&mut self, spans: &[StyledSpan]) -> Vec<String> {
        let mut lines = Vec::new();
        for span in spans {
            let mut parts = span.text.split('\n').peekable();
            while let Some(part) = parts.next() {
                if !part.is_empty() {
                    self.pending.push(StyledSpan::new(part, span.style));
                }
                if parts.peek().is_some() {
                    lines.push(self.take_line());
                }
            }
        }
        lines
    }

    /// Remove characters from the unfinished line. Lines already printed
    /// stay as they are.
    pub fn erase(&mut self, mut chars: usize) {
        while chars > 0 {
            let Some(last) = self.pending.last_mut() else {
                break;
            };
            let len = last.text.chars().count();
            if len <= chars {
                chars -= len;
                self.pending.pop();
            } else {
                last.text = last.text.chars().take(len - chars).collect();
                chars = 0;
            }
        }
    }

    /// The unfinished line, if any.
    pub fn flush(&mut self) -> Option<String> {
        (!self.pending.is_empty()).then(|| self.take_line())
    }

    fn take_line(&mut self) -> String {
        std::mem::take(&mut self.pending)
            .iter()
            .map(|span| render_span(span).to_string())
            .collect()
    }
}

/// Spinner until every kind reported a total, then a bar.
pub struct RunProgress {
    bar: ProgressBar,
    determinate: bool,
}

impl RunProgress {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message("waiting for resource totals");
        bar.enable_steady_tick(Duration::from_millis(100));
        Self {
            bar,
            determinate: false,
        }
    }

    /// Print a line above the bar.
    pub fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line);
    }

    pub fn update(&mut self, progress: &ProgressSnapshot) {
        if !progress.ready {
            return;
        }
        if !self.determinate {
            let style = ProgressStyle::with_template(
                "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
            self.bar.set_style(style);
            self.determinate = true;
        }
        self.bar.set_length(progress.total);
        self.bar.set_position(progress.completed);
        self.bar.set_message(match progress.percent() {
            Some(percent) => format!("{percent}%"),
            None => String::new(),
        });
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_printer_splits_lines() {
        colored::control::set_override(false);
        let mut printer = LinePrinter::default();

        let lines = printer.push(&[
            StyledSpan::plain("Creating "),
            StyledSpan::colored("vpc\nCreating", Color::Green),
        ]);
        assert_eq!(lines, vec!["Creating vpc".to_string()]);

        let lines = printer.push(&[StyledSpan::plain(" subnet\n\n")]);
        assert_eq!(lines, vec!["Creating subnet".to_string(), String::new()]);
        assert_eq!(printer.flush(), None);
    }

    #[test]
    fn test_line_printer_erases_pending_text() {
        colored::control::set_override(false);
        let mut printer = LinePrinter::default();

        printer.push(&[StyledSpan::plain("10"), StyledSpan::colored("%", Color::Cyan)]);
        printer.erase(2);
        printer.push(&[StyledSpan::plain("5%")]);
        assert_eq!(printer.flush(), Some("15%".to_string()));

        printer.erase(10);
        assert_eq!(printer.flush(), None);
    }
}
