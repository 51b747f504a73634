//! Startup and host-side error types.
//!
//! Runtime connection failures never surface here: they are resolved inside
//! the connection state machine into a status transition plus terminal text.
//! These errors cover what can go wrong before the event loop starts (config,
//! terminal setup) and are reported by `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    ConfigParse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("no server URL configured (set [server] url, --url or WSTERM_URL)")]
    MissingUrl,
    #[error("invalid server URL {0}: expected a ws:// or wss:// URL")]
    InvalidUrl(String),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error("terminal setup failed: {0}")]
    Terminal(#[from] nix::Error),
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] crate::session_id::StoreError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
