//! Status content shown to the user while the shell is not usable.
//!
//! [`Overlay`] is plain data handed to the host; how it is drawn is up to the
//! host. Terminal states are additionally written into the terminal itself as a
//! boxed message via [`render_box`], so the explanation stays in scrollback.

use std::fmt::Write as _;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayKind {
    Connecting,
    Reconnecting,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlay {
    pub kind: OverlayKind,
    pub title: String,
    pub lines: Vec<String>,
}

impl Overlay {
    pub fn connecting(attempt: u32, max_attempts: u32) -> Self {
        let mut lines = Vec::new();
        if attempt > 0 {
            lines.push(format!("Attempt {attempt}/{max_attempts}"));
        }
        Self {
            kind: if attempt > 0 {
                OverlayKind::Reconnecting
            } else {
                OverlayKind::Connecting
            },
            title: if attempt > 0 {
                "RECONNECTING".to_string()
            } else {
                "CONNECTING".to_string()
            },
            lines,
        }
    }

    pub fn reconnecting(attempt: u32, max_attempts: u32) -> Self {
        Self {
            kind: OverlayKind::Reconnecting,
            title: "RECONNECTING".to_string(),
            lines: vec![
                format!("Attempt {attempt}/{max_attempts}"),
                "Press Enter to cancel".to_string(),
            ],
        }
    }

    pub fn error(title: &str, lines: Vec<String>) -> Self {
        Self {
            kind: OverlayKind::Error,
            title: title.to_string(),
            lines,
        }
    }

    pub fn info(title: &str, lines: Vec<String>) -> Self {
        Self {
            kind: OverlayKind::Info,
            title: title.to_string(),
            lines,
        }
    }

    /// Update the countdown line of a reconnecting overlay.
    pub fn set_countdown(&mut self, remaining_ms: u64) {
        self.lines.retain(|l| !l.starts_with("Next attempt in"));
        if remaining_ms > 0 {
            let secs = remaining_ms.div_ceil(1000);
            let at = self.lines.len().min(1);
            self.lines.insert(at, format!("Next attempt in {secs}s"));
        }
    }

    /// One-line summary, for hosts that draw a status bar.
    pub fn summary(&self) -> String {
        if self.lines.is_empty() {
            self.title.clone()
        } else {
            format!("{} | {}", self.title, self.lines.join(" | "))
        }
    }
}

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// Draw `overlay` as a box, CRLF line endings, ready to write to a raw terminal.
pub fn render_box(overlay: &Overlay) -> String {
    let colour = match overlay.kind {
        OverlayKind::Error => RED,
        _ => YELLOW,
    };
    let width = std::iter::once(&overlay.title)
        .chain(overlay.lines.iter())
        .map(|l| l.chars().count())
        .max()
        .unwrap_or(0)
        + 2;
    let bar = "─".repeat(width);

    let mut out = String::new();
    let _ = write!(out, "\r\n{colour}┌{bar}┐{RESET}\r\n");
    let _ = write!(
        out,
        "{colour}│{RESET} {BOLD}{:<w$}{RESET} {colour}│{RESET}\r\n",
        overlay.title,
        w = width - 2
    );
    for line in &overlay.lines {
        let _ = write!(out, "{colour}│{RESET} {:<w$} {colour}│{RESET}\r\n", line, w = width - 2);
    }
    let _ = write!(out, "{colour}└{bar}┘{RESET}\r\n");
    out
}
