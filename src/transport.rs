//! Socket abstraction used by the connection state machine.
//!
//! [`WsTransport`] runs one I/O task per socket generation. The task owns the
//! WebSocket, forwards every inbound frame and lifecycle change into the event
//! channel tagged with its generation, and drains an outbound command queue.
//! Opening a new generation aborts the previous task unless it is in the middle
//! of a close handshake, which is allowed to finish within [`CLOSE_GRACE`].
//!
//! Failures never return errors to the caller. A failed handshake or a broken
//! stream is reported as `Error` followed by `Closed { code: 1006 }`; a close
//! frame without a status code as `Closed { code: 1005 }`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::connection::{Event, Frame, SocketEvent};

/// "No status received": the peer closed without a code.
pub const NO_STATUS_CODE: u16 = 1005;
/// "Abnormal closure": the connection dropped without a close handshake.
pub const ABNORMAL_CLOSURE_CODE: u16 = 1006;

/// How long a closing socket waits for the peer's close reply.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Socket lifecycle, as exposed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    #[default]
    Closed,
}

impl ReadyState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// What the machine needs from a socket. Calls never block; results come back
/// as [`SocketEvent`]s on the event channel.
pub trait Transport {
    /// Open a socket for `generation`, superseding any current one.
    fn open(&mut self, url: &str, generation: u64);
    /// Queue a text frame. Returns `false` when there is no open socket.
    fn send(&mut self, text: String) -> bool;
    /// Start a close handshake on the current socket.
    fn close(&mut self, code: u16, reason: &str);
    fn ready_state(&self) -> ReadyState;
}

enum Command {
    Send(String),
    Close { code: u16, reason: String },
}

struct Generation {
    id: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<AtomicU8>,
    task: JoinHandle<()>,
}

impl Generation {
    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// WebSocket transport over `tokio-tungstenite`.
pub struct WsTransport {
    events: mpsc::UnboundedSender<Event>,
    current: Option<Generation>,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<Event>) -> Self {
        Self {
            events,
            current: None,
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, url: &str, generation: u64) {
        if let Some(old) = self.current.take() {
            if old.ready_state() == ReadyState::Closing {
                debug!(generation = old.id, "Letting superseded socket finish closing");
            } else {
                debug!(generation = old.id, "Aborting superseded socket");
                old.task.abort();
            }
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        let task = tokio::spawn(run_socket(
            url.to_string(),
            generation,
            rx,
            Arc::clone(&state),
            self.events.clone(),
        ));
        self.current = Some(Generation {
            id: generation,
            commands,
            state,
            task,
        });
    }

    fn send(&mut self, text: String) -> bool {
        match &self.current {
            Some(g) if g.ready_state() == ReadyState::Open => {
                g.commands.send(Command::Send(text)).is_ok()
            }
            _ => false,
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        let Some(g) = &self.current else {
            return;
        };
        match g.ready_state() {
            ReadyState::Open => {
                g.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
                let _ = g.commands.send(Command::Close {
                    code,
                    reason: reason.to_string(),
                });
            }
            ReadyState::Connecting => {
                // Nothing to hand-shake with yet.
                g.task.abort();
                g.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
                let _ = self.events.send(Event::Socket {
                    generation: g.id,
                    event: SocketEvent::Closed {
                        code,
                        reason: reason.to_string(),
                    },
                });
            }
            ReadyState::Closing | ReadyState::Closed => {}
        }
    }

    fn ready_state(&self) -> ReadyState {
        self.current
            .as_ref()
            .map_or(ReadyState::Closed, Generation::ready_state)
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        if let Some(g) = self.current.take() {
            g.task.abort();
        }
    }
}

async fn run_socket(
    url: String,
    generation: u64,
    mut commands: mpsc::UnboundedReceiver<Command>,
    state: Arc<AtomicU8>,
    events: mpsc::UnboundedSender<Event>,
) {
    let emit = |event: SocketEvent| {
        let _ = events.send(Event::Socket { generation, event });
    };
    let set_state = |s: ReadyState| state.store(s as u8, Ordering::SeqCst);

    let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            warn!(generation, "WebSocket connect failed: {e}");
            set_state(ReadyState::Closed);
            emit(SocketEvent::Error(e.to_string()));
            emit(SocketEvent::Closed {
                code: ABNORMAL_CLOSURE_CODE,
                reason: String::new(),
            });
            return;
        }
    };
    info!(generation, "WebSocket connected");
    set_state(ReadyState::Open);
    emit(SocketEvent::Open);

    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    emit(SocketEvent::Message(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Binary(data))) => {
                    emit(SocketEvent::Message(Frame::Binary(data.to_vec())));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_details(frame.as_ref());
                    set_state(ReadyState::Closed);
                    emit(SocketEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(e)) => {
                    set_state(ReadyState::Closed);
                    emit(SocketEvent::Error(e.to_string()));
                    emit(SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: String::new(),
                    });
                    return;
                }
                None => {
                    set_state(ReadyState::Closed);
                    emit(SocketEvent::Closed {
                        code: ABNORMAL_CLOSURE_CODE,
                        reason: String::new(),
                    });
                    return;
                }
            },
            cmd = commands.recv() => match cmd {
                Some(Command::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        warn!(generation, "WebSocket send failed: {e}");
                    }
                }
                Some(Command::Close { code, reason }) => {
                    set_state(ReadyState::Closing);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.clone().into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!(generation, "Close frame not delivered: {e}");
                    }
                    let reply = tokio::time::timeout(CLOSE_GRACE, async {
                        while let Some(msg) = stream.next().await {
                            match msg {
                                Ok(Message::Close(frame)) => return frame,
                                Ok(_) => {}
                                Err(_) => return None,
                            }
                        }
                        None
                    })
                    .await;
                    let (code, reason) = match reply {
                        Ok(Some(frame)) => close_details(Some(&frame)),
                        _ => (code, reason),
                    };
                    set_state(ReadyState::Closed);
                    emit(SocketEvent::Closed { code, reason });
                    return;
                }
                None => {
                    // Transport dropped.
                    let _ = sink.close().await;
                    set_state(ReadyState::Closed);
                    return;
                }
            },
        }
    }
}

fn close_details(frame: Option<&CloseFrame>) -> (u16, String) {
    frame.map_or((NO_STATUS_CODE, String::new()), |f| {
        (u16::from(f.code), f.reason.as_str().to_owned())
    })
}
