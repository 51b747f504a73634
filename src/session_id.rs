//! Resumable session identity.
//!
//! The server names each shell session in its `hello` message. Sending that id
//! back in the next auth payload lets the server re-attach the same shell after
//! a network drop or a client restart. [`SessionIdentity`] holds the id for one
//! terminal session and mirrors it into a [`SessionStore`] when resumption is
//! enabled.
//!
//! The file store keeps one JSON object per user, mapping a store key (SHA-256
//! of the server URL) to the last session id seen for that server.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session store I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("session store {path} is not valid JSON: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Persistent key/value storage for session ids.
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn save(&self, key: &str, session_id: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Store key for a server URL: lowercase hex SHA-256 of the URL.
pub fn store_key(url: &str) -> String {
    let digest = Sha256::digest(url.as_bytes());
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(key, "{byte:02x}");
    }
    key
}

/// In-memory store, used when resumption is disabled and in tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), session_id.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// JSON file store. Writes go to a temp file that is renamed over the target.
#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
            }
        }
        let json = serde_json::to_string_pretty(entries).map_err(|source| StoreError::Json {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_err(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all()?.remove(key))
    }

    fn save(&self, key: &str, session_id: &str) -> Result<(), StoreError> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), session_id.to_string());
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// Session id for one terminal session, optionally mirrored to a store.
pub struct SessionIdentity {
    current: Option<String>,
    resume: bool,
    key: String,
    store: Arc<dyn SessionStore>,
}

impl SessionIdentity {
    pub fn new(url: &str, resume: bool, store: Arc<dyn SessionStore>) -> Self {
        Self {
            current: None,
            resume,
            key: store_key(url),
            store,
        }
    }

    /// Load the persisted id on mount. No-op when resumption is disabled.
    pub fn restore(&mut self) {
        if !self.resume {
            return;
        }
        match self.store.load(&self.key) {
            Ok(id) => {
                if let Some(ref id) = id {
                    debug!(session_id = %id, "Restored session id");
                }
                self.current = id;
            }
            Err(e) => warn!("Failed to read persisted session id: {e}"),
        }
    }

    /// Record the id assigned by the server's `hello`.
    pub fn assign(&mut self, session_id: &str) {
        self.current = Some(session_id.to_string());
        if self.resume {
            if let Err(e) = self.store.save(&self.key, session_id) {
                warn!("Failed to persist session id: {e}");
            }
        }
    }

    /// Forget the id: the session can no longer be resumed.
    pub fn purge(&mut self) {
        self.current = None;
        if !self.resume {
            return;
        }
        if let Err(e) = self.store.remove(&self.key) {
            warn!("Failed to remove persisted session id: {e}");
        }
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn resume_enabled(&self) -> bool {
        self.resume
    }
}
