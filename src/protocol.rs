//! Wire protocol spoken with the terminal server.
//!
//! ## Client → server
//!
//! | Message            | When                      | Shape                                                          |
//! |--------------------|---------------------------|----------------------------------------------------------------|
//! | auth               | once, right after open    | `{environmentVariables, apiKey?, accessToken?, sessionId?}`    |
//! | keystrokes         | any time while open       | raw text frame, forwarded verbatim                             |
//! | resize             | window change, activation | `{"type":"resize","cols":c,"rows":r}`                          |
//!
//! ## Server → client
//!
//! | Message   | Shape                                                                 | Handling                 |
//! |-----------|-----------------------------------------------------------------------|--------------------------|
//! | hello     | `{"type":"hello","sessionId":"..."}`                                  | session identity         |
//! | status    | `{"type":"status","payload":"connecting\|connected\|disconnected\|error","reason"?}` | state machine |
//! | meta      | `{"stream":true,"hijack":true,"stdin":true,"stdout":true,"stderr":true}` | discarded             |
//! | PTY data  | anything else (text or binary)                                        | written to the terminal  |
//!
//! Decoding is an explicit two-step: a frame that parses as JSON is matched
//! against the known control shapes; anything unmatched (including plain
//! numbers or objects the shell happened to print) falls back to PTY data.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Environment variable that tells the server it is serving this client.
pub const CLIENT_MODE_ENV: &str = "ABLY_WEB_CLI_MODE";

/// First message on every socket.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub environment_variables: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl AuthPayload {
    /// Build the payload; `extra_env` entries cannot override the client-mode flag.
    pub fn new(
        api_key: Option<&str>,
        access_token: Option<&str>,
        extra_env: &BTreeMap<String, String>,
        session_id: Option<&str>,
    ) -> Self {
        let mut environment_variables = extra_env.clone();
        environment_variables.insert(CLIENT_MODE_ENV.to_string(), "true".to_string());
        Self {
            environment_variables,
            api_key: api_key.map(ToString::to_string),
            access_token: access_token.map(ToString::to_string),
            session_id: session_id.map(ToString::to_string),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Terminal size update.
pub fn resize_message(cols: u16, rows: u16) -> String {
    serde_json::json!({ "type": "resize", "cols": cols, "rows": rows }).to_string()
}

/// `payload` of a server `status` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Known control messages, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Control {
    Hello {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    Status {
        payload: ServerStatus,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Hello { session_id: String },
    Status { status: ServerStatus, reason: Option<String> },
    /// Stream attach meta-message; never shown.
    StreamMeta,
    /// A control message with a known `type` but an unusable body.
    Ignored,
    /// PTY output destined for the terminal.
    Data(String),
}

impl Inbound {
    /// Decode a text frame.
    pub fn decode_text(text: &str) -> Self {
        let Ok(value) = serde_json::from_str::<Value>(text) else {
            return Self::Data(text.to_string());
        };
        if is_stream_meta(&value) {
            return Self::StreamMeta;
        }
        let hello = value.get("type").and_then(Value::as_str) == Some("hello");
        match serde_json::from_value::<Control>(value) {
            Ok(Control::Hello { session_id }) => Self::Hello { session_id },
            Ok(Control::Status { payload, reason }) => Self::Status {
                status: payload,
                reason,
            },
            Err(_) if hello => Self::Ignored,
            Err(_) => Self::Data(text.to_string()),
        }
    }
}

fn is_stream_meta(value: &Value) -> bool {
    value.get("stream").and_then(Value::as_bool) == Some(true)
        && value.get("hijack").is_some_and(Value::is_boolean)
}

/// A chunk made only of JSON punctuation and lowercase words, with at least one
/// `"key":` pair.
static META_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*\{?[\s"a-z:,]*"\s*:[\s"a-z:,]*\}?\s*$"#).expect("static regex")
});

static META_KEYWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"stream|hijack|stdin|stdout|stderr").expect("static regex"));

/// Whether `text` looks like a piece of a stream meta-message split across
/// frames, e.g. `{"stream":true,"std` followed by `in":true,...,"hijack":true}`.
///
/// Pattern-based rather than framed, so a PTY chunk that is itself shaped like
/// `"stdout": true` is also dropped.
pub fn is_meta_fragment(text: &str) -> bool {
    META_KEYWORD.is_match(text) && META_SHAPE.is_match(text)
}

/// Maximum bytes in an incomplete UTF-8 sequence carried to the next frame.
const MAX_PARTIAL: usize = 4;

/// Decodes binary PTY frames into text, carrying a multi-byte character that was
/// split across frames over to the next call instead of replacing both halves.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode<'a>(&mut self, data: &'a [u8]) -> Cow<'a, str> {
        if self.partial.is_empty() {
            if let Ok(s) = std::str::from_utf8(data) {
                return Cow::Borrowed(s);
            }
        }

        let mut combined = std::mem::take(&mut self.partial);
        combined.extend_from_slice(data);

        let valid_up_to = match std::str::from_utf8(&combined) {
            Ok(_) => combined.len(),
            Err(e) => e.valid_up_to(),
        };
        let trailing = &combined[valid_up_to..];
        if is_incomplete_start(trailing) {
            self.partial = trailing.to_vec();
            return Cow::Owned(String::from_utf8_lossy(&combined[..valid_up_to]).into_owned());
        }
        Cow::Owned(String::from_utf8_lossy(&combined).into_owned())
    }

    pub fn reset(&mut self) {
        self.partial.clear();
    }
}

/// A truncated (not invalid) multi-byte sequence.
fn is_incomplete_start(bytes: &[u8]) -> bool {
    let Some(&lead) = bytes.first() else {
        return false;
    };
    let expected = match lead {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF7 => 4,
        _ => return false,
    };
    bytes.len() < expected
        && bytes.len() < MAX_PARTIAL
        && bytes[1..].iter().all(|b| (0x80..=0xBF).contains(b))
}
