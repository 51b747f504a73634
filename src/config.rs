//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `--url`, `--api-key`, ... (applied by `main`)
//! 2. **Environment variables** — `WSTERM_URL`, `WSTERM_API_KEY`,
//!    `WSTERM_ACCESS_TOKEN`, `WSTERM_MAX_RECONNECT_ATTEMPTS`
//! 3. **Config file** — path via `--config <path>`, or `wsterm.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! url = "wss://shell.example.com/"
//!
//! [auth]
//! api_key = "app.key:secret"
//! access_token = "..."            # optional, sent alongside or instead of api_key
//!
//! [reconnect]
//! max_attempts = 15
//! abnormal_closure_recoverable = false   # retry 1005/1006 instead of stopping
//!
//! [session]
//! resume = true                          # persist the server session id
//! store_path = "~/.local/state/wsterm/sessions.json"
//! initial_command = "help"               # typed once after the prompt appears
//!
//! [session.env]
//! TERM = "xterm-256color"
//!
//! [terminal]
//! send_resize = true
//!
//! [logging]
//! level = "warn"
//! file = "/tmp/wsterm.log"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Default config file looked up in the current directory.
const DEFAULT_CONFIG_FILE: &str = "wsterm.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote command server endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// WebSocket URL of the terminal server. Override with `WSTERM_URL`.
    pub url: Option<String>,
}

/// Credentials sent in the auth payload after the socket opens.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// API key. Override with `WSTERM_API_KEY`.
    pub api_key: Option<String>,
    /// Access token. Override with `WSTERM_ACCESS_TOKEN`.
    pub access_token: Option<String>,
}

/// Automatic reconnect policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Ceiling on consecutive failed attempts (default 15, minimum 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Treat close codes 1005/1006 as transient network failures and retry
    /// them (default false: they require a manual reconnect).
    #[serde(default)]
    pub abnormal_closure_recoverable: bool,
}

/// Remote session behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Persist the server-assigned session id so a restart can resume the
    /// same shell (default true).
    #[serde(default = "default_resume")]
    pub resume: bool,
    /// File holding persisted session ids, keyed per server URL.
    #[serde(default = "default_store_path")]
    pub store_path: String,
    /// Command typed into the shell once the session first becomes active.
    pub initial_command: Option<String>,
    /// Extra environment variables forwarded in the auth payload.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Local terminal integration.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalConfig {
    /// Forward local window-size changes to the server (default true).
    #[serde(default = "default_send_resize")]
    pub send_resize: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `warn`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file. When unset, logs go to stderr.
    pub file: Option<String>,
}

fn default_max_attempts() -> u32 {
    15
}
fn default_resume() -> bool {
    true
}
fn default_store_path() -> String {
    "~/.local/state/wsterm/sessions.json".to_string()
}
fn default_send_resize() -> bool {
    true
}
fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            abnormal_closure_recoverable: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            resume: default_resume(),
            store_path: default_store_path(),
            initial_command: None,
            env: BTreeMap::new(),
        }
    }
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            send_resize: default_send_resize(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl SessionConfig {
    /// `store_path` with a leading `~` replaced by `$HOME`.
    pub fn resolved_store_path(&self) -> PathBuf {
        let raw = self.store_path.as_str();
        let rest = match raw.strip_prefix('~') {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
            _ => return PathBuf::from(raw),
        };
        match std::env::var_os("HOME") {
            Some(home) => {
                let mut path = PathBuf::from(home);
                path.push(rest.trim_start_matches('/'));
                path
            }
            None => PathBuf::from(raw),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (an error if missing). Otherwise
    /// looks for `wsterm.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| Error::ConfigParse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document into a config.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply `WSTERM_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("WSTERM_URL") {
            self.server.url = Some(url);
        }
        if let Some(key) = lookup("WSTERM_API_KEY") {
            self.auth.api_key = Some(key);
        }
        if let Some(token) = lookup("WSTERM_ACCESS_TOKEN") {
            self.auth.access_token = Some(token);
        }
        if let Some(raw) = lookup("WSTERM_MAX_RECONNECT_ATTEMPTS") {
            self.reconnect.max_attempts = raw.parse().map_err(|_| Error::InvalidEnv {
                name: "WSTERM_MAX_RECONNECT_ATTEMPTS",
                value: raw.clone(),
            })?;
        }
        Ok(())
    }

    /// The configured server URL, validated to be a WebSocket URL.
    pub fn server_url(&self) -> Result<&str> {
        let url = self.server.url.as_deref().ok_or(Error::MissingUrl)?;
        if url.starts_with("ws://") || url.starts_with("wss://") {
            Ok(url)
        } else {
            Err(Error::InvalidUrl(url.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.reconnect.max_attempts, 15);
        assert!(!config.reconnect.abnormal_closure_recoverable);
        assert!(config.session.resume);
        assert!(config.terminal.send_resize);
        assert_eq!(config.logging.level, "warn");
        assert!(matches!(config.server_url(), Err(Error::MissingUrl)));
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::parse(
            r#"
            [server]
            url = "wss://shell.example.com/"

            [reconnect]
            max_attempts = 3

            [session]
            initial_command = "help"

            [session.env]
            TERM = "xterm-256color"
            "#,
        )
        .unwrap();
        assert_eq!(config.server_url().unwrap(), "wss://shell.example.com/");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.session.initial_command.as_deref(), Some("help"));
        assert_eq!(config.session.env["TERM"], "xterm-256color");
        assert!(config.session.resume);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::parse("[server]\nurl = \"ws://file\"\n").unwrap();
        config
            .apply_env(|name| match name {
                "WSTERM_URL" => Some("wss://env".to_string()),
                "WSTERM_MAX_RECONNECT_ATTEMPTS" => Some("4".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.server.url.as_deref(), Some("wss://env"));
        assert_eq!(config.reconnect.max_attempts, 4);
    }

    #[test]
    fn rejects_bad_env_number() {
        let mut config = Config::default();
        let err = config
            .apply_env(|name| (name == "WSTERM_MAX_RECONNECT_ATTEMPTS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidEnv { .. }));
    }

    #[test]
    fn store_path_expands_home() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        let session = SessionConfig {
            store_path: "~/state/sessions.json".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(
            session.resolved_store_path(),
            PathBuf::from(home).join("state/sessions.json")
        );

        let absolute = SessionConfig {
            store_path: "/var/lib/wsterm.json".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(absolute.resolved_store_path(), PathBuf::from("/var/lib/wsterm.json"));

        let other_user = SessionConfig {
            store_path: "~bob/x.json".to_string(),
            ..SessionConfig::default()
        };
        assert_eq!(other_user.resolved_store_path(), PathBuf::from("~bob/x.json"));
    }

    #[test]
    fn rejects_http_url() {
        let mut config = Config::default();
        config.server.url = Some("https://shell.example.com".to_string());
        assert!(matches!(config.server_url(), Err(Error::InvalidUrl(_))));
    }
}
