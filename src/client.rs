//! Command-line host: wires the state machine to the real terminal and socket.

use std::io::{IsTerminal, Write};
use std::ops::ControlFlow;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bridge::{self, StdoutTerminal, TerminalGuard};
use crate::config::Config;
use crate::connection::{ClosePolicy, ConnectionMachine, Event, MachineOptions, Overlay, SessionHost};
use crate::error::Result;
use crate::reconnect::{AttemptTracker, ReconnectScheduler};
use crate::session_id::{store_key, FileSessionStore, MemorySessionStore, SessionIdentity, SessionStore};
use crate::status::ConnectionStatus;
use crate::transport::WsTransport;

const TITLE_PREFIX: &str = "wsterm";

/// Host for the CLI. Status goes to the log; the overlay is shown in the
/// terminal window title, which stays out of the remote shell's screen.
pub struct CliHost {
    titles: bool,
}

impl CliHost {
    pub fn new() -> Self {
        Self {
            titles: std::io::stderr().is_terminal(),
        }
    }

    fn set_title(&self, title: &str) {
        if !self.titles {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\x1b]2;{title}\x07");
        let _ = stderr.flush();
    }
}

impl Default for CliHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHost for CliHost {
    fn on_connection_status_change(&mut self, status: ConnectionStatus) {
        info!(status = %status, "Connection status changed");
        if status == ConnectionStatus::Connected {
            self.set_title(TITLE_PREFIX);
        }
    }

    fn on_session_end(&mut self, reason: &str) {
        warn!("Session ended: {reason}");
    }

    fn on_session_id(&mut self, session_id: &str) {
        debug!(session_id, "Session id assigned");
    }

    fn on_overlay(&mut self, overlay: Option<&Overlay>) {
        match overlay {
            Some(o) => self.set_title(&format!("{TITLE_PREFIX}: {}", o.summary())),
            None => self.set_title(TITLE_PREFIX),
        }
    }
}

/// Session-id store for `config`: the JSON file when resumption is on,
/// otherwise a throwaway in-memory map.
pub fn session_store(config: &Config) -> Arc<dyn SessionStore> {
    if config.session.resume {
        Arc::new(FileSessionStore::new(config.session.resolved_store_path()))
    } else {
        Arc::new(MemorySessionStore::new())
    }
}

pub fn machine_options(config: &Config, url: &str) -> MachineOptions {
    MachineOptions {
        url: url.to_string(),
        api_key: config.auth.api_key.clone(),
        access_token: config.auth.access_token.clone(),
        env: config.session.env.clone(),
        initial_command: config.session.initial_command.clone(),
        send_resize: config.terminal.send_resize,
        close_policy: ClosePolicy {
            abnormal_closure_recoverable: config.reconnect.abnormal_closure_recoverable,
        },
    }
}

/// Run one interactive session until the user detaches or stdin closes.
pub async fn run(config: Config) -> Result<()> {
    let url = config.server_url()?.to_string();
    info!(url = %url, "Starting terminal session");

    let tracker = Arc::new(AttemptTracker::new(config.reconnect.max_attempts));
    let scheduler = Arc::new(ReconnectScheduler::new(tracker));
    let identity = SessionIdentity::new(&url, config.session.resume, session_store(&config));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let _terminal = TerminalGuard::enter()?;
    bridge::spawn_stdin_reader(tx.clone());
    let resize_watcher = bridge::spawn_resize_watcher(tx.clone())?;
    let shutdown_watcher = bridge::spawn_shutdown_watcher(tx.clone())?;

    let mut machine = ConnectionMachine::new(
        machine_options(&config, &url),
        scheduler,
        identity,
        WsTransport::new(tx.clone()),
        StdoutTerminal,
        CliHost::new(),
        tx,
    );
    if let Some((cols, rows)) = bridge::window_size() {
        let _ = machine.handle(Event::Resize { cols, rows });
    }
    machine.start();

    while let Some(event) = rx.recv().await {
        if let ControlFlow::Break(()) = machine.handle(event) {
            break;
        }
    }

    resize_watcher.abort();
    shutdown_watcher.abort();
    info!(status = %machine.status(), "Session closed");
    Ok(())
}

/// Drop the persisted session id for the configured server.
pub fn forget(config: &Config) -> Result<bool> {
    let url = config.server_url()?;
    let store = FileSessionStore::new(config.session.resolved_store_path());
    let key = store_key(url);
    let existed = store.load(&key)?.is_some();
    store.remove(&key)?;
    info!(url, existed, store = %store.path().display(), "Forgot session");
    Ok(existed)
}
