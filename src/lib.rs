#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::too_many_arguments)]

//! # wsterm
//!
//! Terminal client for remote shells served over WebSocket. The client keeps
//! one interactive session alive across network trouble: it retries with a
//! fixed backoff, resumes the same server-side shell by session id, and hands
//! control back to the user (press Enter) when retrying is pointless.
//!
//! ## Module layout
//!
//! ```text
//! lib.rs             — crate root, re-exports
//! main.rs            — clap CLI, tracing setup
//! config.rs          — TOML + env-var configuration
//! error.rs           — startup error type
//! status.rs          — ConnectionStatus
//! reconnect/
//!   backoff.rs       — AttemptTracker, backoff schedule, timer slots
//!   scheduler.rs     — ReconnectScheduler (retry timer + countdown)
//! session_id.rs      — SessionIdentity and session-id stores
//! prompt.rs          — shell prompt detection over PTY output
//! protocol.rs        — auth payload, inbound message decoding, UTF-8 reassembly
//! connection/
//!   mod.rs           — ConnectionMachine, events, host/terminal traits
//!   close.rs         — close-code policy
//!   overlay.rs       — status overlay content and boxes
//! transport.rs       — Transport trait, tokio-tungstenite implementation
//! bridge.rs          — raw mode, stdin/stdout, window size, focus reports
//! client.rs          — CLI host and event loop
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod prompt;
pub mod protocol;
pub mod reconnect;
pub mod session_id;
pub mod status;
pub mod transport;

pub use connection::{ConnectionMachine, Event, SessionHost, TerminalSink};
pub use error::{Error, Result};
pub use reconnect::{AttemptTracker, ReconnectScheduler};
pub use status::ConnectionStatus;
