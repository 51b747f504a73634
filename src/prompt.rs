//! Shell prompt detection over streamed PTY output.
//!
//! The socket being open does not mean the remote shell is usable; the session
//! only counts as active once the prompt marker shows up in the output.
//! [`PromptDetector`] keeps a sliding window of the most recent output and
//! looks for the `"$ "` marker in it, ignoring ANSI escape sequences so a
//! coloured prompt (`\x1b[32muser@host\x1b[0m:~$ `) still matches.

use std::sync::LazyLock;

use regex::Regex;

/// Capacity of the output window, in characters.
pub const MAX_PTY_BUFFER_LENGTH: usize = 10_000;

/// Literal marker that ends a default POSIX shell prompt.
pub const PROMPT_MARKER: &str = "$ ";

/// CSI sequences (`ESC [ ... final`) and OSC sequences (`ESC ] ... BEL|ST`).
static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("static regex")
});

/// Remove CSI and OSC escape sequences from `text`.
pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

/// Bounded accumulator that reports when a shell prompt appears.
#[derive(Debug, Default)]
pub struct PromptDetector {
    buffer: String,
    /// Character count of `buffer`, tracked to avoid rescanning on every push.
    chars: usize,
}

impl PromptDetector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of output and report whether the window now holds a prompt.
    pub fn push(&mut self, chunk: &str) -> bool {
        self.buffer.push_str(chunk);
        self.chars += chunk.chars().count();
        self.evict();
        self.has_prompt()
    }

    /// Whether the current window contains the prompt marker.
    pub fn has_prompt(&self) -> bool {
        self.buffer.contains(PROMPT_MARKER) || strip_ansi(&self.buffer).contains(PROMPT_MARKER)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.chars = 0;
    }

    pub fn len(&self) -> usize {
        self.chars
    }

    pub fn is_empty(&self) -> bool {
        self.chars == 0
    }

    pub fn contents(&self) -> &str {
        &self.buffer
    }

    /// Drop characters from the front until at most `MAX_PTY_BUFFER_LENGTH` remain.
    fn evict(&mut self) {
        if self.chars <= MAX_PTY_BUFFER_LENGTH {
            return;
        }
        let excess = self.chars - MAX_PTY_BUFFER_LENGTH;
        let cut = self
            .buffer
            .char_indices()
            .nth(excess)
            .map_or(self.buffer.len(), |(i, _)| i);
        self.buffer.drain(..cut);
        self.chars = MAX_PTY_BUFFER_LENGTH;
    }
}
