//! Local terminal plumbing: raw mode, stdin, stdout, window size and focus.
//!
//! The local terminal is put into raw mode so every keystroke (Ctrl-C, arrow
//! keys, tab) reaches the remote shell. Focus reporting (DEC private mode 1004)
//! is switched on so the terminal tells us when its window loses focus; that is
//! what drives the session's visibility and inactivity handling.
//!
//! `Ctrl-]` is kept local and detaches the client, like `telnet`.

use std::io::{IsTerminal, Read, Write};

use nix::sys::termios::{self, SetArg, Termios};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{Event, TerminalSink};
use crate::error::Result;

/// Byte sent by `Ctrl-]`.
pub const DETACH_KEY: u8 = 0x1d;

pub const FOCUS_REPORTING_ON: &str = "\x1b[?1004h";
pub const FOCUS_REPORTING_OFF: &str = "\x1b[?1004l";
const FOCUS_IN: &[u8] = b"\x1b[I";
const FOCUS_OUT: &[u8] = b"\x1b[O";
const CSI_PREFIX: &[u8] = b"\x1b[";

/// Raw mode plus focus reporting for the lifetime of the guard.
///
/// A no-op when stdin is not a terminal (piped input), so the client can be
/// scripted.
pub struct TerminalGuard {
    saved: Option<Termios>,
}

impl TerminalGuard {
    pub fn enter() -> Result<Self> {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            debug!("stdin is not a terminal, leaving line discipline alone");
            return Ok(Self { saved: None });
        }
        let saved = termios::tcgetattr(&stdin)?;
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;

        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(FOCUS_REPORTING_ON.as_bytes());
        let _ = stdout.flush();
        Ok(Self { saved: Some(saved) })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let Some(saved) = self.saved.take() else {
            return;
        };
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(FOCUS_REPORTING_OFF.as_bytes());
        let _ = stdout.flush();
        if let Err(e) = termios::tcsetattr(&std::io::stdin(), SetArg::TCSANOW, &saved) {
            warn!("Failed to restore terminal mode: {e}");
        }
    }
}

/// Current window size as `(cols, rows)`, if stdout is a terminal.
pub fn window_size() -> Option<(u16, u16)> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCGWINSZ only writes into the winsize struct we pass.
    let rc = unsafe { libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) };
    (rc == 0 && winsize.ws_col > 0).then_some((winsize.ws_col, winsize.ws_row))
}

/// Splits raw stdin bytes into keystrokes, focus changes and the detach key.
#[derive(Debug, Default)]
pub struct InputParser {
    /// A trailing `ESC [` that may be the start of a focus report.
    pending: Vec<u8>,
}

impl InputParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut plain = Vec::new();
        let mut i = 0;
        while i < data.len() {
            let rest = &data[i..];
            if rest.starts_with(FOCUS_IN) || rest.starts_with(FOCUS_OUT) {
                flush(&mut plain, &mut events);
                events.push(Event::Focus(rest.starts_with(FOCUS_IN)));
                i += FOCUS_IN.len();
            } else if rest == CSI_PREFIX {
                self.pending = rest.to_vec();
                break;
            } else if rest[0] == DETACH_KEY {
                flush(&mut plain, &mut events);
                events.push(Event::Shutdown);
                return events;
            } else {
                plain.push(rest[0]);
                i += 1;
            }
        }
        flush(&mut plain, &mut events);
        events
    }
}

fn flush(plain: &mut Vec<u8>, events: &mut Vec<Event>) {
    if !plain.is_empty() {
        events.push(Event::Input(std::mem::take(plain)));
    }
}

/// Read stdin on a dedicated thread and feed the event channel.
///
/// A plain thread rather than `tokio::io::stdin`, whose blocking read would
/// keep the runtime from shutting down. EOF ends the session.
pub fn spawn_stdin_reader(events: mpsc::UnboundedSender<Event>) {
    std::thread::spawn(move || {
        let mut stdin = std::io::stdin();
        let mut parser = InputParser::new();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => {
                    let _ = events.send(Event::Shutdown);
                    break;
                }
                Ok(n) => {
                    for event in parser.feed(&buf[..n]) {
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
}

/// Forward SIGWINCH as `Event::Resize`.
pub fn spawn_resize_watcher(events: mpsc::UnboundedSender<Event>) -> Result<JoinHandle<()>> {
    let mut winch = signal(SignalKind::window_change())?;
    Ok(tokio::spawn(async move {
        while winch.recv().await.is_some() {
            let Some((cols, rows)) = window_size() else {
                continue;
            };
            debug!(cols, rows, "Window resized");
            if events.send(Event::Resize { cols, rows }).is_err() {
                break;
            }
        }
    }))
}

/// Turn SIGTERM and SIGHUP into a clean shutdown so the terminal mode is
/// restored.
pub fn spawn_shutdown_watcher(events: mpsc::UnboundedSender<Event>) -> Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => debug!("Received SIGTERM"),
            _ = sighup.recv() => debug!("Received SIGHUP"),
        }
        let _ = events.send(Event::Shutdown);
    }))
}

/// Writes PTY output to stdout.
#[derive(Debug, Default)]
pub struct StdoutTerminal;

impl TerminalSink for StdoutTerminal {
    fn write(&mut self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = stdout.write_all(text.as_bytes()).and_then(|()| stdout.flush()) {
            warn!("Failed to write to terminal: {e}");
        }
    }
}
