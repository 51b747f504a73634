//! Attempt counter and backoff schedule shared by every terminal session.
//!
//! [`AttemptTracker`] is constructed once per process and handed to each
//! [`ConnectionMachine`](crate::connection::ConnectionMachine) as an `Arc`, so
//! re-creating a session object does not reset an ongoing retry storm.
//!
//! Counters are atomics; the two timer handles sit behind a std `Mutex` that is
//! only held long enough to swap a `JoinHandle`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Default ceiling on consecutive failed attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

/// Delay before retry number `attempt`.
///
/// Fixed steps rather than true exponential growth: 0 → 0 s, 1 → 2 s,
/// 2 → 4 s, anything later → 8 s. No jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    match attempt {
        0 => Duration::ZERO,
        1 => Duration::from_millis(2000),
        2 => Duration::from_millis(4000),
        _ => Duration::from_millis(8000),
    }
}

/// A single replaceable timer handle. Arming a new timer aborts the previous one.
#[derive(Default)]
pub struct TimerSlot {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerSlot {
    /// Store `handle`, aborting whatever timer was there before.
    pub fn replace(&self, handle: JoinHandle<()>) {
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Abort and forget the live timer, if any.
    pub fn clear(&self) {
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Whether a timer is armed and has not finished yet.
    pub fn is_armed(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

/// Process-wide reconnect bookkeeping.
pub struct AttemptTracker {
    attempts: AtomicU32,
    cancelled: AtomicBool,
    max_attempts: AtomicU32,
    remaining_time_ms: AtomicU64,
    pub(crate) retry_timer: TimerSlot,
    pub(crate) countdown_timer: TimerSlot,
}

impl AttemptTracker {
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            max_attempts: AtomicU32::new(max_attempts.max(1)),
            remaining_time_ms: AtomicU64::new(0),
            retry_timer: TimerSlot::default(),
            countdown_timer: TimerSlot::default(),
        }
    }

    /// Record one failed attempt. The ceiling is enforced by the scheduler.
    pub fn increment(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.load(Ordering::SeqCst)
    }

    /// Set the ceiling; values below 1 are stored as 1.
    pub fn set_max_attempts(&self, n: u32) {
        self.max_attempts.store(n.max(1), Ordering::SeqCst);
    }

    pub fn is_max_attempts_reached(&self) -> bool {
        self.attempts() >= self.max_attempts()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cancelled(&self, cancelled: bool) {
        self.cancelled.store(cancelled, Ordering::SeqCst);
    }

    /// Countdown value last published to the UI, in milliseconds.
    pub fn remaining_time_ms(&self) -> u64 {
        self.remaining_time_ms.load(Ordering::SeqCst)
    }

    pub(crate) fn set_remaining_time_ms(&self, ms: u64) {
        self.remaining_time_ms.store(ms, Ordering::SeqCst);
    }

    /// Abandon the retry sequence: cancel, clear timers, reset attempts.
    pub fn cancel_reconnect(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.clear_timers();
        self.attempts.store(0, Ordering::SeqCst);
        self.remaining_time_ms.store(0, Ordering::SeqCst);
    }

    /// Soft reset used when re-entering a connecting state. Leaves `attempts`
    /// and the cancelled flag alone.
    pub fn reset_state(&self) {
        self.clear_timers();
        self.remaining_time_ms.store(0, Ordering::SeqCst);
    }

    /// The remote shell is confirmed usable: start the next failure sequence
    /// from scratch.
    pub fn successful_connection_reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.reset_state();
    }

    /// The user explicitly asked for a fresh connection. Same reset as a
    /// success so the new attempt gets a clean backoff sequence.
    pub fn begin_manual_attempt(&self) {
        self.successful_connection_reset();
    }

    fn clear_timers(&self) {
        self.retry_timer.clear();
        self.countdown_timer.clear();
    }
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
