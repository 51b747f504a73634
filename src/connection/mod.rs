//! Connection state machine for one remote terminal session.
//!
//! [`ConnectionMachine`] owns the socket lifecycle: it opens sockets through a
//! [`Transport`], authenticates, routes inbound frames to the terminal, watches
//! for the shell prompt, and decides after every close whether to retry, stop,
//! or wait for the user.
//!
//! Everything that can happen to a session arrives as an [`Event`] on one
//! channel and is handled to completion before the next one: socket events,
//! keystrokes, focus changes, window resizes and timer expiries. Socket events
//! carry the generation of the socket that produced them; anything from a
//! superseded generation is dropped, so a late close from an old socket can
//! never drive the current one.
//!
//! ```text
//!  initial ──► connecting ──► connected ──► reconnecting ──► connecting ...
//!                  │   ▲            │             │
//!                  ▼   │ (Enter)    ▼             ▼
//!               error / disconnected ◄────────────┘
//! ```

pub mod close;
pub mod overlay;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::prompt::PromptDetector;
use crate::protocol::{self, AuthPayload, Inbound, ServerStatus, Utf8Decoder};
use crate::reconnect::{ReconnectScheduler, TimerSlot};
use crate::session_id::SessionIdentity;
use crate::status::ConnectionStatus;
use crate::transport::{ReadyState, Transport};

pub use close::{CloseDisposition, ClosePolicy};
pub use overlay::{render_box, Overlay, OverlayKind};

/// Pause between the user pressing Enter and the manual reconnect, so the
/// purge of the old session settles first.
pub const MANUAL_RECONNECT_SETTLE: Duration = Duration::from_millis(100);

/// How long the terminal may stay hidden before an open session is closed.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// A WebSocket data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Something that happened to one socket generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Open,
    Message(Frame),
    Error(String),
    Closed { code: u16, reason: String },
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Socket { generation: u64, event: SocketEvent },
    /// Bytes typed by the user.
    Input(Vec<u8>),
    /// Terminal gained (`true`) or lost (`false`) focus.
    Focus(bool),
    Resize { cols: u16, rows: u16 },
    /// The reconnect timer fired.
    RetryDue,
    /// Countdown tick, remaining milliseconds until the next attempt.
    Countdown(u64),
    /// The settle delay after a manual reconnect request elapsed.
    ManualReconnectDue,
    /// The inactivity timer armed at the given epoch fired.
    InactivityTimeout(u64),
    Shutdown,
}

/// Where PTY output and status boxes are written.
pub trait TerminalSink {
    fn write(&mut self, text: &str);
}

/// Notifications for whatever embeds the session. All methods default to no-ops.
///
/// `on_connection_status_change` fires only when the status value changes, so
/// a run of retries reports `reconnecting` once. Per-attempt progress (attempt
/// number, countdown) arrives through `on_overlay`.
pub trait SessionHost {
    fn on_connection_status_change(&mut self, _status: ConnectionStatus) {}
    fn on_session_end(&mut self, _reason: &str) {}
    fn on_session_id(&mut self, _session_id: &str) {}
    fn on_overlay(&mut self, _overlay: Option<&Overlay>) {}
}

/// Who asked for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Mount, visibility or retry timer. Respects the cancelled/maxed state.
    Auto,
    /// The user pressed Enter at a reconnect prompt.
    Manual,
}

/// Static per-session settings.
#[derive(Debug, Clone, Default)]
pub struct MachineOptions {
    pub url: String,
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub env: std::collections::BTreeMap<String, String>,
    pub initial_command: Option<String>,
    pub send_resize: bool,
    pub close_policy: ClosePolicy,
}

pub struct ConnectionMachine<T, S, H> {
    options: MachineOptions,
    scheduler: Arc<ReconnectScheduler>,
    events: mpsc::UnboundedSender<Event>,
    transport: T,
    terminal: S,
    host: H,
    identity: SessionIdentity,
    detector: PromptDetector,
    output_decoder: Utf8Decoder,
    input_decoder: Utf8Decoder,
    status: ConnectionStatus,
    generation: u64,
    session_active: bool,
    manual_prompt: bool,
    visible: bool,
    connect_attempted: bool,
    /// A connect that came due while hidden, replayed on the next focus.
    deferred_connect: Option<ConnectMode>,
    initial_command_sent: bool,
    /// The next close was initiated by us or announced by the server and
    /// must not be retried.
    expect_terminal_close: bool,
    overlay: Option<Overlay>,
    window: Option<(u16, u16)>,
    settle_timer: TimerSlot,
    inactivity_timer: TimerSlot,
    inactivity_epoch: u64,
}

impl<T, S, H> ConnectionMachine<T, S, H>
where
    T: Transport,
    S: TerminalSink,
    H: SessionHost,
{
    pub fn new(
        options: MachineOptions,
        scheduler: Arc<ReconnectScheduler>,
        identity: SessionIdentity,
        transport: T,
        terminal: S,
        host: H,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            options,
            scheduler,
            events,
            transport,
            terminal,
            host,
            identity,
            detector: PromptDetector::new(),
            output_decoder: Utf8Decoder::new(),
            input_decoder: Utf8Decoder::new(),
            status: ConnectionStatus::Initial,
            generation: 0,
            session_active: false,
            manual_prompt: false,
            visible: true,
            connect_attempted: false,
            deferred_connect: None,
            initial_command_sent: false,
            expect_terminal_close: false,
            overlay: None,
            window: None,
            settle_timer: TimerSlot::default(),
            inactivity_timer: TimerSlot::default(),
            inactivity_epoch: 0,
        }
    }

    /// Mount: restore the persisted session id, hook the countdown into the
    /// event channel and make the first connection attempt.
    pub fn start(&mut self) {
        self.identity.restore();
        let tx = self.events.clone();
        self.scheduler
            .set_countdown_callback(Some(Arc::new(move |ms: u64| {
                let _ = tx.send(Event::Countdown(ms));
            })));
        self.connect(ConnectMode::Auto);
    }

    /// Handle one event. Returns `Break` once the session should stop.
    pub fn handle(&mut self, event: Event) -> ControlFlow<()> {
        match event {
            Event::Socket { generation, event } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Dropping event from stale socket");
                    return ControlFlow::Continue(());
                }
                self.on_socket(event);
            }
            Event::Input(bytes) => self.on_input(&bytes),
            Event::Focus(visible) => self.on_visibility(visible),
            Event::Resize { cols, rows } => self.on_resize(cols, rows),
            Event::RetryDue => {
                if self.scheduler.tracker().is_cancelled() {
                    debug!("Retry due after cancellation, ignoring");
                } else {
                    self.connect(ConnectMode::Auto);
                }
            }
            Event::Countdown(ms) => self.on_countdown(ms),
            Event::ManualReconnectDue => {
                self.scheduler.tracker().begin_manual_attempt();
                self.connect(ConnectMode::Manual);
            }
            Event::InactivityTimeout(epoch) => self.on_inactivity(epoch),
            Event::Shutdown => {
                self.shutdown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    pub fn connect(&mut self, mode: ConnectMode) {
        if !self.visible {
            debug!(mode = ?mode, "Terminal hidden, deferring connect");
            if self.deferred_connect != Some(ConnectMode::Manual) {
                self.deferred_connect = Some(mode);
            }
            return;
        }
        self.deferred_connect = None;
        let state = self.transport.ready_state();
        if mode == ConnectMode::Auto && matches!(state, ReadyState::Open | ReadyState::Connecting) {
            debug!(state = state.as_str(), "Socket already live, skipping connect");
            return;
        }
        if state != ReadyState::Closed {
            self.transport.close(1000, "superseded");
        }
        self.connect_attempted = true;

        let tracker = Arc::clone(self.scheduler.tracker());
        if mode == ConnectMode::Auto && (tracker.is_cancelled() || tracker.is_max_attempts_reached()) {
            info!(
                cancelled = tracker.is_cancelled(),
                attempts = tracker.attempts(),
                "Not connecting automatically, waiting for user"
            );
            self.set_status(ConnectionStatus::Disconnected);
            self.manual_prompt = true;
            return;
        }

        let attempts = tracker.attempts();
        self.set_status(if attempts > 0 {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Connecting
        });
        self.show_overlay(Overlay::connecting(attempts, tracker.max_attempts()));

        self.generation += 1;
        self.session_active = false;
        self.expect_terminal_close = false;
        self.detector.clear();
        self.output_decoder.reset();
        info!(url = %self.options.url, generation = self.generation, attempts, "Opening socket");
        self.transport.open(&self.options.url, self.generation);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_session_active(&self) -> bool {
        self.session_active
    }

    pub fn is_awaiting_manual_reconnect(&self) -> bool {
        self.manual_prompt
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn terminal(&self) -> &S {
        &self.terminal
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    fn on_socket(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Open => self.on_open(),
            SocketEvent::Message(frame) => self.on_message(frame),
            SocketEvent::Error(message) => self.on_error(&message),
            SocketEvent::Closed { code, reason } => self.on_close(code, &reason),
        }
    }

    fn on_open(&mut self) {
        info!(generation = self.generation, "Socket open, authenticating");
        self.manual_prompt = false;
        if !self.visible {
            self.arm_inactivity_timer();
        }
        self.detector.clear();
        let payload = AuthPayload::new(
            self.options.api_key.as_deref(),
            self.options.access_token.as_deref(),
            &self.options.env,
            self.identity.current(),
        );
        if !self.transport.send(payload.to_json()) {
            warn!("Failed to queue auth payload");
        }
    }

    fn on_message(&mut self, frame: Frame) {
        match frame {
            Frame::Text(text) => match Inbound::decode_text(&text) {
                Inbound::Hello { session_id } => {
                    debug!(session_id = %session_id, "Server assigned session");
                    self.identity.assign(&session_id);
                    self.host.on_session_id(&session_id);
                }
                Inbound::Status { status, reason } => self.on_server_status(status, reason),
                Inbound::StreamMeta => debug!("Discarding stream meta message"),
                Inbound::Ignored => debug!("Discarding malformed control message"),
                Inbound::Data(data) => self.on_pty_data(&data),
            },
            Frame::Binary(bytes) => {
                let text = self.output_decoder.decode(&bytes).into_owned();
                if !text.is_empty() {
                    self.on_pty_data(&text);
                }
            }
        }
    }

    fn on_server_status(&mut self, status: ServerStatus, reason: Option<String>) {
        match status {
            ServerStatus::Connected => {
                info!("Server reports session connected");
                self.activate(true);
            }
            ServerStatus::Connecting => debug!("Server is preparing the session"),
            ServerStatus::Error | ServerStatus::Disconnected => {
                let reason = reason.unwrap_or_else(|| "Session ended by server".to_string());
                warn!(status = ?status, reason = %reason, "Server ended the session");
                self.terminal.write(&format!("\r\n\x1b[31m{reason}\x1b[0m\r\n"));
                self.host.on_session_end(&reason);
                self.set_status(if status == ServerStatus::Error {
                    ConnectionStatus::Error
                } else {
                    ConnectionStatus::Disconnected
                });
                self.session_active = false;
                self.expect_terminal_close = true;
                if !matches!(
                    self.transport.ready_state(),
                    ReadyState::Closing | ReadyState::Closed
                ) {
                    self.transport.close(1000, "session-ended");
                }
                self.identity.purge();
            }
        }
    }

    fn on_pty_data(&mut self, text: &str) {
        if protocol::is_meta_fragment(text) {
            debug!(len = text.len(), "Suppressing stream meta fragment");
            return;
        }
        self.terminal.write(text);
        if !self.session_active && self.detector.push(text) {
            info!("Shell prompt detected");
            self.activate(false);
        }
    }

    /// The remote shell is usable.
    fn activate(&mut self, from_server_status: bool) {
        self.session_active = true;
        self.clear_overlay();
        self.scheduler.tracker().successful_connection_reset();
        self.set_status(ConnectionStatus::Connected);
        if from_server_status {
            self.transport.send("\r".to_string());
        }
        self.detector.clear();

        if let Some((cols, rows)) = self.window {
            self.send_resize(cols, rows);
        }
        if !self.initial_command_sent {
            if let Some(command) = self.options.initial_command.clone() {
                info!(command = %command, "Typing initial command");
                self.transport.send(format!("{command}\r"));
            }
            self.initial_command_sent = true;
        }
    }

    fn on_error(&mut self, message: &str) {
        warn!(generation = self.generation, "Socket error: {message}");
        let tracker = self.scheduler.tracker();
        let retrying = !tracker.is_cancelled() && !tracker.is_max_attempts_reached();
        if retrying {
            self.set_status(ConnectionStatus::Error);
        }
    }

    fn on_close(&mut self, code: u16, reason: &str) {
        info!(generation = self.generation, code, reason, "Socket closed");
        self.session_active = false;
        let tracker = Arc::clone(self.scheduler.tracker());

        let terminal = std::mem::take(&mut self.expect_terminal_close)
            || self.options.close_policy.classify(code) == CloseDisposition::Terminal;
        if terminal {
            tracker.cancel_reconnect();
            self.set_status(ConnectionStatus::Disconnected);
            // Inactivity and user cancels already drew their own box.
            if !self.manual_prompt {
                let detail = if reason.is_empty() {
                    close::describe(code).to_string()
                } else {
                    reason.to_string()
                };
                self.show_box(Overlay::error(
                    "DISCONNECTED",
                    vec![
                        format!("Code {code}: {detail}"),
                        "Press Enter to reconnect".to_string(),
                    ],
                ));
            }
            self.identity.purge();
            self.manual_prompt = true;
            return;
        }

        if tracker.is_cancelled() || tracker.is_max_attempts_reached() {
            self.stop_retrying();
            return;
        }

        let attempt = tracker.increment();
        let tx = self.events.clone();
        let scheduled = self.scheduler.schedule_reconnect(
            move || {
                let _ = tx.send(Event::RetryDue);
            },
            &self.options.url,
        );
        if scheduled {
            self.set_status(ConnectionStatus::Reconnecting);
            let mut overlay = Overlay::reconnecting(attempt, tracker.max_attempts());
            overlay.set_countdown(tracker.remaining_time_ms());
            self.show_overlay(overlay);
        } else {
            self.stop_retrying();
        }
    }

    /// Retries are exhausted or were cancelled: park at the manual prompt.
    fn stop_retrying(&mut self) {
        let tracker = Arc::clone(self.scheduler.tracker());
        self.set_status(ConnectionStatus::Disconnected);
        if self.manual_prompt {
            return;
        }
        if tracker.is_max_attempts_reached() {
            warn!(attempts = tracker.attempts(), "Giving up on reconnecting");
            self.show_box(Overlay::error(
                "MAX RECONNECTS",
                vec![
                    format!("Gave up after {} attempts", tracker.attempts()),
                    "Press Enter to reconnect".to_string(),
                ],
            ));
        } else {
            self.show_box(Overlay::info(
                "RECONNECT CANCELLED",
                vec![
                    "Reconnect cancelled by user".to_string(),
                    "Press Enter to reconnect".to_string(),
                ],
            ));
        }
        self.manual_prompt = true;
    }

    fn on_input(&mut self, bytes: &[u8]) {
        let enter = bytes.iter().any(|b| *b == b'\r' || *b == b'\n');
        if self.manual_prompt {
            if enter {
                self.request_manual_reconnect();
            }
            return;
        }
        if self.status == ConnectionStatus::Reconnecting
            && !self.scheduler.tracker().is_cancelled()
            && enter
        {
            self.cancel_by_user();
            return;
        }
        if self.transport.ready_state() == ReadyState::Open {
            let text = self.input_decoder.decode(bytes).into_owned();
            if !text.is_empty() {
                self.transport.send(text);
            }
        }
    }

    fn request_manual_reconnect(&mut self) {
        info!("Manual reconnect requested");
        self.manual_prompt = false;
        self.identity.purge();
        self.clear_overlay();
        self.terminal.write("\r\nReconnecting...\r\n");
        let tx = self.events.clone();
        self.settle_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(MANUAL_RECONNECT_SETTLE).await;
            let _ = tx.send(Event::ManualReconnectDue);
        }));
    }

    fn cancel_by_user(&mut self) {
        info!("Reconnect cancelled by user");
        self.scheduler.tracker().cancel_reconnect();
        self.show_box(Overlay::info(
            "RECONNECT CANCELLED",
            vec![
                "Reconnect cancelled by user".to_string(),
                "Press Enter to reconnect".to_string(),
            ],
        ));
        self.manual_prompt = true;
        self.deferred_connect = None;
        self.set_status(ConnectionStatus::Disconnected);
        if self.transport.ready_state() != ReadyState::Closed {
            self.transport.close(1000, "cancelled");
        }
    }

    fn on_visibility(&mut self, visible: bool) {
        self.visible = visible;
        self.inactivity_epoch += 1;
        if visible {
            self.inactivity_timer.clear();
            if let Some(mode) = self.deferred_connect.take() {
                self.connect(mode);
            } else if !self.connect_attempted {
                self.connect(ConnectMode::Auto);
            }
            return;
        }
        // A socket still handshaking arms the timer from `on_open`.
        if self.transport.ready_state() == ReadyState::Open {
            self.arm_inactivity_timer();
        }
    }

    fn arm_inactivity_timer(&mut self) {
        debug!("Terminal hidden, arming inactivity timer");
        let epoch = self.inactivity_epoch;
        let tx = self.events.clone();
        self.inactivity_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(INACTIVITY_TIMEOUT).await;
            let _ = tx.send(Event::InactivityTimeout(epoch));
        }));
    }

    fn on_inactivity(&mut self, epoch: u64) {
        if epoch != self.inactivity_epoch || self.visible {
            return;
        }
        if self.transport.ready_state() != ReadyState::Open {
            return;
        }
        info!("Closing session after inactivity");
        self.expect_terminal_close = true;
        self.transport
            .close(close::INACTIVITY_CLOSE_CODE, close::INACTIVITY_CLOSE_REASON);
        self.scheduler.tracker().cancel_reconnect();
        self.manual_prompt = true;
        self.show_box(Overlay::info(
            "SESSION PAUSED",
            vec![
                "Closed after inactivity".to_string(),
                "Press Enter to reconnect".to_string(),
            ],
        ));
        self.set_status(ConnectionStatus::Disconnected);
    }

    fn on_resize(&mut self, cols: u16, rows: u16) {
        self.window = Some((cols, rows));
        if self.session_active {
            self.send_resize(cols, rows);
        }
    }

    fn send_resize(&mut self, cols: u16, rows: u16) {
        if self.options.send_resize && self.transport.ready_state() == ReadyState::Open {
            self.transport.send(protocol::resize_message(cols, rows));
        }
    }

    fn on_countdown(&mut self, remaining_ms: u64) {
        if let Some(overlay) = self.overlay.as_mut() {
            if overlay.kind == OverlayKind::Reconnecting {
                overlay.set_countdown(remaining_ms);
                self.host.on_overlay(self.overlay.as_ref());
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down session");
        self.settle_timer.clear();
        self.inactivity_timer.clear();
        self.deferred_connect = None;
        self.scheduler.tracker().reset_state();
        self.scheduler.set_countdown_callback(None);
        if self.transport.ready_state() != ReadyState::Closed {
            self.transport.close(1000, "client-exit");
        }
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "Status change");
        self.status = status;
        self.host.on_connection_status_change(status);
    }

    fn show_overlay(&mut self, overlay: Overlay) {
        self.overlay = Some(overlay);
        self.host.on_overlay(self.overlay.as_ref());
    }

    /// Terminal states are also written into the terminal so they stay in
    /// scrollback.
    fn show_box(&mut self, overlay: Overlay) {
        self.terminal.write(&render_box(&overlay));
        self.show_overlay(overlay);
    }

    fn clear_overlay(&mut self) {
        if self.overlay.take().is_some() {
            self.host.on_overlay(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::AttemptTracker;
    use crate::session_id::{store_key, MemorySessionStore, SessionStore};
    use serde_json::Value;

    const URL: &str = "wss://shell.test/";

    #[derive(Default)]
    struct FakeTransport {
        state: ReadyState,
        opened: Vec<u64>,
        sent: Vec<String>,
        closed: Vec<(u16, String)>,
    }

    impl Transport for FakeTransport {
        fn open(&mut self, _url: &str, generation: u64) {
            self.opened.push(generation);
            self.state = ReadyState::Connecting;
        }

        fn send(&mut self, text: String) -> bool {
            if self.state != ReadyState::Open {
                return false;
            }
            self.sent.push(text);
            true
        }

        fn close(&mut self, code: u16, reason: &str) {
            self.closed.push((code, reason.to_string()));
            self.state = ReadyState::Closing;
        }

        fn ready_state(&self) -> ReadyState {
            self.state
        }
    }

    #[derive(Default)]
    struct RecordingTerminal {
        writes: Vec<String>,
    }

    impl RecordingTerminal {
        fn all(&self) -> String {
            self.writes.concat()
        }
    }

    impl TerminalSink for RecordingTerminal {
        fn write(&mut self, text: &str) {
            self.writes.push(text.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingHost {
        statuses: Vec<ConnectionStatus>,
        session_ends: Vec<String>,
        session_ids: Vec<String>,
        overlays: Vec<Option<Overlay>>,
    }

    impl SessionHost for RecordingHost {
        fn on_connection_status_change(&mut self, status: ConnectionStatus) {
            self.statuses.push(status);
        }
        fn on_session_end(&mut self, reason: &str) {
            self.session_ends.push(reason.to_string());
        }
        fn on_session_id(&mut self, session_id: &str) {
            self.session_ids.push(session_id.to_string());
        }
        fn on_overlay(&mut self, overlay: Option<&Overlay>) {
            self.overlays.push(overlay.cloned());
        }
    }

    type Machine = ConnectionMachine<FakeTransport, RecordingTerminal, RecordingHost>;

    struct Harness {
        machine: Machine,
        rx: mpsc::UnboundedReceiver<Event>,
        store: Arc<MemorySessionStore>,
    }

    fn harness_with(options: MachineOptions, max: u32, resume: bool, store: Arc<MemorySessionStore>) -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Arc::new(ReconnectScheduler::new(Arc::new(AttemptTracker::new(max))));
        let identity = SessionIdentity::new(URL, resume, store.clone());
        let machine = ConnectionMachine::new(
            options,
            scheduler,
            identity,
            FakeTransport::default(),
            RecordingTerminal::default(),
            RecordingHost::default(),
            tx,
        );
        Harness { machine, rx, store }
    }

    fn options() -> MachineOptions {
        MachineOptions {
            url: URL.to_string(),
            api_key: Some("key".to_string()),
            send_resize: true,
            ..MachineOptions::default()
        }
    }

    fn harness(max: u32) -> Harness {
        harness_with(options(), max, true, Arc::new(MemorySessionStore::new()))
    }

    fn recoverable_abnormal() -> MachineOptions {
        MachineOptions {
            close_policy: ClosePolicy {
                abnormal_closure_recoverable: true,
            },
            ..options()
        }
    }

    impl Harness {
        fn tracker(&self) -> &Arc<AttemptTracker> {
            self.machine.scheduler.tracker()
        }

        fn socket(&mut self, event: SocketEvent) {
            let generation = self.machine.generation();
            let _ = self.machine.handle(Event::Socket { generation, event });
        }

        fn open(&mut self) {
            self.machine.transport.state = ReadyState::Open;
            self.socket(SocketEvent::Open);
        }

        fn close(&mut self, code: u16) {
            self.machine.transport.state = ReadyState::Closed;
            self.socket(SocketEvent::Closed {
                code,
                reason: String::new(),
            });
        }

        fn text(&mut self, text: &str) {
            self.socket(SocketEvent::Message(Frame::Text(text.to_string())));
        }

        fn input(&mut self, bytes: &[u8]) {
            let _ = self.machine.handle(Event::Input(bytes.to_vec()));
        }

        /// Feed channel events into the machine until one matching `stop` is handled.
        async fn run_until(&mut self, stop: fn(&Event) -> bool) {
            loop {
                let event = self.rx.recv().await.expect("event channel open");
                let done = stop(&event);
                let _ = self.machine.handle(event);
                if done {
                    return;
                }
            }
        }

        fn auth_payloads(&self) -> Vec<Value> {
            self.machine
                .transport
                .sent
                .iter()
                .filter_map(|s| serde_json::from_str::<Value>(s).ok())
                .filter(|v| v.get("environmentVariables").is_some())
                .collect()
        }
    }

    fn is_retry(e: &Event) -> bool {
        matches!(e, Event::RetryDue)
    }

    fn is_manual(e: &Event) -> bool {
        matches!(e, Event::ManualReconnectDue)
    }

    #[tokio::test(start_paused = true)]
    async fn start_opens_first_socket() {
        let mut h = harness(15);
        h.machine.start();
        assert_eq!(h.machine.transport.opened, vec![1]);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
        assert_eq!(h.machine.overlay().map(|o| o.kind), Some(OverlayKind::Connecting));
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_closures_retry_until_ceiling() {
        let mut h = harness_with(recoverable_abnormal(), 3, true, Arc::new(MemorySessionStore::new()));
        h.machine.start();

        for expected in 1..=2 {
            h.close(1006);
            assert_eq!(h.tracker().attempts(), expected);
            assert!(h.machine.scheduler.has_pending_retry());
            assert_eq!(h.machine.status(), ConnectionStatus::Reconnecting);
            h.run_until(is_retry).await;
            assert_eq!(h.machine.transport.opened.len(), expected as usize + 1);
            assert_eq!(h.machine.status(), ConnectionStatus::Reconnecting);
        }

        h.close(1006);
        assert_eq!(h.tracker().attempts(), 3);
        assert!(!h.machine.scheduler.has_pending_retry());
        assert!(h.machine.terminal.all().contains("MAX RECONNECTS"));
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        assert!(h.machine.is_awaiting_manual_reconnect());
        assert_eq!(
            h.machine.host.statuses,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Reconnecting,
                ConnectionStatus::Disconnected
            ]
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.machine.transport.opened.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn recoverable_code_retries_with_default_policy() {
        let mut h = harness(3);
        h.machine.start();
        for _ in 0..2 {
            h.close(4500);
            h.run_until(is_retry).await;
        }
        h.close(4500);
        assert_eq!(h.tracker().attempts(), 3);
        assert!(h.machine.terminal.all().contains("MAX RECONNECTS"));
        assert_eq!(h.machine.transport.opened.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn abnormal_closure_is_terminal_by_default() {
        let mut h = harness(15);
        h.machine.start();
        h.close(1006);
        assert_eq!(h.tracker().attempts(), 0);
        assert!(!h.machine.scheduler.has_pending_retry());
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        assert!(h.machine.terminal.all().contains("Code 1006"));
    }

    #[tokio::test(start_paused = true)]
    async fn auth_failure_waits_for_enter() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.close(4001);
        assert_eq!(h.tracker().attempts(), 0);
        assert!(!h.machine.scheduler.has_pending_retry());
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        assert!(h.machine.terminal.all().contains("Press Enter to reconnect"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.machine.transport.opened.len(), 1);

        h.input(b"x");
        assert_eq!(h.machine.transport.opened.len(), 1);
        h.input(b"\r");
        h.run_until(is_manual).await;
        assert_eq!(h.machine.transport.opened, vec![1, 2]);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
        assert_eq!(
            h.machine.host.statuses,
            vec![
                ConnectionStatus::Connecting,
                ConnectionStatus::Disconnected,
                ConnectionStatus::Connecting
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn error_then_close_counts_one_attempt() {
        let mut h = harness_with(recoverable_abnormal(), 15, true, Arc::new(MemorySessionStore::new()));
        h.machine.start();
        h.socket(SocketEvent::Error("handshake failed".to_string()));
        assert_eq!(h.tracker().attempts(), 0);
        assert_eq!(h.machine.status(), ConnectionStatus::Error);
        h.close(1006);
        assert_eq!(h.tracker().attempts(), 1);
        assert_eq!(h.machine.status(), ConnectionStatus::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn split_meta_message_is_never_written() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text(r#"{"stream":true,"std"#);
        h.text(r#"in":true,"stdout":true,"stderr":true,"hijack":true}"#);
        assert!(h.machine.terminal.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn whole_meta_message_is_never_written() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text(r#"{"stream":true,"stdin":true,"stdout":true,"stderr":true,"hijack":true}"#);
        assert!(h.machine.terminal.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hello_session_id_is_resumed_on_next_connect() {
        let store = Arc::new(MemorySessionStore::new());
        let mut first = harness_with(options(), 15, true, store.clone());
        first.machine.start();
        first.open();
        assert!(first.auth_payloads()[0].get("sessionId").is_none());
        first.text(r#"{"type":"hello","sessionId":"S1"}"#);
        assert!(first.machine.terminal.writes.is_empty());
        assert_eq!(first.machine.host.session_ids, vec!["S1".to_string()]);
        assert_eq!(first.store.load(&store_key(URL)).unwrap().as_deref(), Some("S1"));

        let mut second = harness_with(options(), 15, true, store);
        second.machine.start();
        second.open();
        let auth = &second.auth_payloads()[0];
        assert_eq!(auth["sessionId"], "S1");
        assert_eq!(auth["apiKey"], "key");
        assert_eq!(auth["environmentVariables"][protocol::CLIENT_MODE_ENV], "true");
    }

    #[tokio::test(start_paused = true)]
    async fn ansi_prompt_marks_session_connected() {
        let mut h = harness(15);
        h.machine.start();
        h.tracker().increment();
        h.open();
        h.text("Welcome\r\n");
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
        let prompt = "\x1b[01;32muser@host\x1b[00m:~$ ";
        h.text(prompt);
        assert_eq!(h.machine.status(), ConnectionStatus::Connected);
        assert!(h.machine.is_session_active());
        assert_eq!(h.tracker().attempts(), 0);
        assert!(h.machine.overlay().is_none());
        assert_eq!(h.machine.terminal.writes, vec!["Welcome\r\n".to_string(), prompt.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn server_connected_status_is_fast_path() {
        let mut h = harness(15);
        h.machine.start();
        h.tracker().increment();
        h.open();
        h.text(r#"{"type":"status","payload":"connected"}"#);
        assert_eq!(h.machine.status(), ConnectionStatus::Connected);
        assert_eq!(h.tracker().attempts(), 0);
        assert_eq!(h.machine.transport.sent.last().map(String::as_str), Some("\r"));
        assert!(h.machine.terminal.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn server_connecting_status_is_informational() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text(r#"{"type":"status","payload":"connecting"}"#);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
        assert!(h.machine.terminal.writes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_status_ends_session() {
        let store = Arc::new(MemorySessionStore::new());
        store.save(&store_key(URL), "S1").unwrap();
        let mut h = harness_with(options(), 15, true, store);
        h.machine.start();
        h.open();
        h.text(r#"{"type":"status","payload":"error","reason":"Quota exceeded"}"#);
        assert_eq!(h.machine.status(), ConnectionStatus::Error);
        assert_eq!(h.machine.host.session_ends, vec!["Quota exceeded".to_string()]);
        assert!(h.machine.terminal.all().contains("Quota exceeded"));
        assert_eq!(h.machine.transport.closed.len(), 1);
        assert_eq!(h.store.load(&store_key(URL)).unwrap(), None);

        h.close(1000);
        assert_eq!(h.tracker().attempts(), 0);
        assert!(!h.machine.scheduler.has_pending_retry());
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        assert!(h.machine.is_awaiting_manual_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_json_is_written_as_output() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text("42\r\n");
        h.text(r#"{"type":"other"}"#);
        assert_eq!(h.machine.terminal.writes, vec!["42\r\n".to_string(), r#"{"type":"other"}"#.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn binary_frames_reassemble_split_characters() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        let bytes = "é$ ".as_bytes().to_vec();
        h.socket(SocketEvent::Message(Frame::Binary(bytes[..1].to_vec())));
        h.socket(SocketEvent::Message(Frame::Binary(bytes[1..].to_vec())));
        assert_eq!(h.machine.terminal.all(), "é$ ");
        assert_eq!(h.machine.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn enter_cancels_pending_reconnect() {
        let mut h = harness(15);
        h.machine.start();
        h.close(4500);
        assert_eq!(h.machine.status(), ConnectionStatus::Reconnecting);
        h.input(b"\r");
        assert!(h.tracker().is_cancelled());
        assert_eq!(h.tracker().attempts(), 0);
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
        assert!(h.machine.terminal.all().contains("cancelled by user"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.machine.transport.opened.len(), 1);

        h.input(b"\r");
        h.run_until(is_manual).await;
        assert_eq!(h.machine.transport.opened.len(), 2);
        assert!(!h.tracker().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_updates_overlay() {
        let mut h = harness(15);
        h.machine.start();
        h.close(4500);
        h.close(4500);
        h.run_until(|e: &Event| matches!(e, Event::Countdown(1000))).await;
        let overlay = h.machine.overlay().cloned().unwrap();
        assert_eq!(overlay.kind, OverlayKind::Reconnecting);
        assert!(overlay.lines.contains(&"Next attempt in 1s".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_events_are_ignored() {
        let mut h = harness_with(recoverable_abnormal(), 15, true, Arc::new(MemorySessionStore::new()));
        h.machine.start();
        h.close(1006);
        h.run_until(is_retry).await;
        assert_eq!(h.machine.generation(), 2);
        let _ = h.machine.handle(Event::Socket {
            generation: 1,
            event: SocketEvent::Closed {
                code: 4500,
                reason: String::new(),
            },
        });
        assert_eq!(h.tracker().attempts(), 1);
        assert_eq!(h.machine.transport.opened.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn keystrokes_are_forwarded_when_open() {
        let mut h = harness(15);
        h.machine.start();
        h.input(b"ls");
        assert!(h.machine.transport.sent.is_empty());
        h.open();
        h.text("$ ");
        h.input(b"ls\r");
        assert_eq!(h.machine.transport.sent.last().map(String::as_str), Some("ls\r"));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_command_is_typed_once() {
        let opts = MachineOptions {
            initial_command: Some("help".to_string()),
            ..recoverable_abnormal()
        };
        let mut h = harness_with(opts, 15, true, Arc::new(MemorySessionStore::new()));
        h.machine.start();
        h.open();
        h.text("$ ");
        h.close(1006);
        h.run_until(is_retry).await;
        h.open();
        h.text("$ ");
        let typed: Vec<_> = h.machine.transport.sent.iter().filter(|s| *s == "help\r").collect();
        assert_eq!(typed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resize_is_sent_after_activation_and_on_change() {
        let mut h = harness(15);
        h.machine.start();
        let _ = h.machine.handle(Event::Resize { cols: 80, rows: 24 });
        h.open();
        assert!(!h.machine.transport.sent.iter().any(|s| s.contains("resize")));
        h.text("$ ");
        assert_eq!(
            h.machine.transport.sent.last().map(String::as_str),
            Some(protocol::resize_message(80, 24).as_str())
        );
        let _ = h.machine.handle(Event::Resize { cols: 120, rows: 40 });
        assert_eq!(
            h.machine.transport.sent.last().map(String::as_str),
            Some(protocol::resize_message(120, 40).as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_terminal_closes_after_inactivity() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text("$ ");
        let _ = h.machine.handle(Event::Focus(false));
        h.run_until(|e: &Event| matches!(e, Event::InactivityTimeout(_))).await;
        assert_eq!(
            h.machine.transport.closed,
            vec![(close::INACTIVITY_CLOSE_CODE, close::INACTIVITY_CLOSE_REASON.to_string())]
        );
        assert!(h.machine.is_awaiting_manual_reconnect());
        h.close(close::INACTIVITY_CLOSE_CODE);
        assert!(!h.machine.scheduler.has_pending_retry());
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn refocus_cancels_inactivity_timer() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        let _ = h.machine.handle(Event::Focus(false));
        tokio::time::sleep(Duration::from_secs(60)).await;
        let _ = h.machine.handle(Event::Focus(true));
        tokio::time::sleep(INACTIVITY_TIMEOUT).await;
        while let Ok(event) = h.rx.try_recv() {
            let _ = h.machine.handle(event);
        }
        assert!(h.machine.transport.closed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_mount_defers_connect_until_visible() {
        let mut h = harness(15);
        let _ = h.machine.handle(Event::Focus(false));
        h.machine.start();
        assert!(h.machine.transport.opened.is_empty());
        let _ = h.machine.handle(Event::Focus(true));
        assert_eq!(h.machine.transport.opened, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_due_while_hidden_runs_on_refocus() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.close(4500);
        let _ = h.machine.handle(Event::Focus(false));
        h.run_until(is_retry).await;
        assert_eq!(h.machine.transport.opened, vec![1]);
        assert!(!h.machine.scheduler.has_pending_retry());

        let _ = h.machine.handle(Event::Focus(true));
        assert_eq!(h.machine.transport.opened, vec![1, 2]);
        assert_eq!(h.machine.status(), ConnectionStatus::Reconnecting);
        assert!(!h.machine.is_awaiting_manual_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn manual_reconnect_while_hidden_runs_on_refocus() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.close(4001);
        h.input(b"\r");
        let _ = h.machine.handle(Event::Focus(false));
        h.run_until(is_manual).await;
        assert_eq!(h.machine.transport.opened, vec![1]);

        let _ = h.machine.handle(Event::Focus(true));
        assert_eq!(h.machine.transport.opened, vec![1, 2]);
        assert_eq!(h.machine.status(), ConnectionStatus::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_during_handshake_still_times_out() {
        let mut h = harness(15);
        h.machine.start();
        let _ = h.machine.handle(Event::Focus(false));
        h.open();
        h.run_until(|e: &Event| matches!(e, Event::InactivityTimeout(_))).await;
        assert_eq!(
            h.machine.transport.closed,
            vec![(close::INACTIVITY_CLOSE_CODE, close::INACTIVITY_CLOSE_REASON.to_string())]
        );
        assert_eq!(h.machine.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn hello_without_session_id_is_not_written() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        h.text(r#"{"type":"hello"}"#);
        assert!(h.machine.terminal.writes.is_empty());
        assert!(h.machine.host.session_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_breaks_and_closes_socket() {
        let mut h = harness(15);
        h.machine.start();
        h.open();
        assert_eq!(h.machine.handle(Event::Shutdown), ControlFlow::Break(()));
        assert_eq!(h.machine.transport.closed, vec![(1000, "client-exit".to_string())]);
    }
}
