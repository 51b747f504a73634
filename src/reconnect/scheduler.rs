//! Single in-flight retry timer plus an optional per-second countdown.
//!
//! ## Cancellation contract
//!
//! [`AttemptTracker::cancel_reconnect`] aborts the live timers, but an armed
//! timer may already be past its sleep when the abort lands. The fired timer
//! therefore re-reads `is_cancelled()` right before invoking the callback; that
//! check, not the abort, is what guarantees a cancelled retry never runs.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::backoff::{backoff_delay, AttemptTracker};

/// Observer for the countdown shown while waiting for the next attempt.
/// Receives the remaining time in milliseconds.
pub type CountdownCallback = Arc<dyn Fn(u64) + Send + Sync>;

const COUNTDOWN_TICK: Duration = Duration::from_secs(1);

/// Arms reconnect timers against a shared [`AttemptTracker`].
pub struct ReconnectScheduler {
    tracker: Arc<AttemptTracker>,
    countdown: Mutex<Option<CountdownCallback>>,
}

impl ReconnectScheduler {
    #[must_use]
    pub fn new(tracker: Arc<AttemptTracker>) -> Self {
        Self {
            tracker,
            countdown: Mutex::new(None),
        }
    }

    pub fn tracker(&self) -> &Arc<AttemptTracker> {
        &self.tracker
    }

    /// Register the countdown observer, replacing any previous one.
    pub fn set_countdown_callback(&self, callback: Option<CountdownCallback>) {
        *self
            .countdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = callback;
    }

    /// Whether a retry timer is armed and has not fired yet.
    pub fn has_pending_retry(&self) -> bool {
        self.tracker.retry_timer.is_armed()
    }

    /// Arm a retry of `callback` after the backoff for the current attempt count.
    ///
    /// Returns `false` without scheduling anything when the attempt ceiling has
    /// been reached; the tracker is marked cancelled in that case. Must be
    /// called from within a tokio runtime.
    pub fn schedule_reconnect<F>(&self, callback: F, url: &str) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let tracker = &self.tracker;
        let attempts = tracker.attempts();
        if attempts >= tracker.max_attempts() {
            info!(
                attempts,
                max = tracker.max_attempts(),
                "Reconnect ceiling reached, not scheduling"
            );
            tracker.set_cancelled(true);
            return false;
        }
        tracker.set_cancelled(false);

        let delay = backoff_delay(attempts);
        #[allow(clippy::cast_possible_truncation)]
        let delay_ms = delay.as_millis() as u64;
        info!(url, attempt = attempts, delay_ms, "Scheduling reconnect");

        let observer = self
            .countdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        match observer {
            Some(observer) if delay_ms > 0 => {
                tracker.set_remaining_time_ms(delay_ms);
                observer(delay_ms);
                let ticker_tracker = Arc::clone(tracker);
                tracker
                    .countdown_timer
                    .replace(tokio::spawn(countdown_task(ticker_tracker, observer, delay_ms)));
            }
            _ => tracker.countdown_timer.clear(),
        }

        let timer_tracker = Arc::clone(tracker);
        tracker.retry_timer.replace(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if timer_tracker.is_cancelled() {
                debug!("Retry timer fired after cancellation, skipping");
                return;
            }
            callback();
        }));
        true
    }
}

async fn countdown_task(tracker: Arc<AttemptTracker>, observer: CountdownCallback, start_ms: u64) {
    let mut remaining = start_ms;
    while remaining > 0 {
        tokio::time::sleep(COUNTDOWN_TICK).await;
        remaining = remaining.saturating_sub(1000);
        tracker.set_remaining_time_ms(remaining);
        observer(remaining);
    }
}
