//! Close-code classification.

/// Codes after which the client never retries on its own:
/// server rejections (auth, policy, capacity, session ended) plus 1005/1006.
pub const NON_RECOVERABLE_CLOSE_CODES: [u16; 8] = [4000, 4001, 4002, 4004, 4008, 1005, 1006, 1013];

/// "No status received" and "abnormal closure": what a dropped network link
/// usually reports.
pub const ABNORMAL_CLOSE_CODES: [u16; 2] = [1005, 1006];

/// Code the client uses when it hangs up on a hidden terminal.
pub const INACTIVITY_CLOSE_CODE: u16 = 4002;
pub const INACTIVITY_CLOSE_REASON: &str = "inactivity-timeout";

/// What to do after a socket closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Retry automatically with backoff.
    Recoverable,
    /// Wait for the user to reconnect.
    Terminal,
}

/// Close-code policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosePolicy {
    /// Retry 1005/1006 instead of treating them as terminal.
    pub abnormal_closure_recoverable: bool,
}

impl ClosePolicy {
    pub fn classify(self, code: u16) -> CloseDisposition {
        if self.abnormal_closure_recoverable && ABNORMAL_CLOSE_CODES.contains(&code) {
            return CloseDisposition::Recoverable;
        }
        if NON_RECOVERABLE_CLOSE_CODES.contains(&code) {
            CloseDisposition::Terminal
        } else {
            CloseDisposition::Recoverable
        }
    }
}

/// Human-readable explanation shown in the disconnect box.
pub fn describe(code: u16) -> &'static str {
    match code {
        1000 => "Connection closed normally",
        1001 => "Server is going away",
        1005 => "Connection closed without a status code",
        1006 => "Connection lost unexpectedly",
        1013 => "Server is at capacity, try again later",
        4000 => "Session rejected by the server",
        4001 => "Authentication failed",
        4002 => "Session ended after inactivity",
        4004 => "Session not found or expired",
        4008 => "Policy violation",
        _ => "Connection closed",
    }
}
