//! Reconnect bookkeeping shared across terminal sessions.
//!
//! - `backoff` — [`AttemptTracker`] (attempt counter, cancel flag, timer slots)
//!   and the fixed-step [`backoff_delay`] schedule
//! - `scheduler` — [`ReconnectScheduler`], which arms the retry timer and the
//!   countdown ticker

pub mod backoff;
pub mod scheduler;

pub use backoff::{backoff_delay, AttemptTracker, TimerSlot, DEFAULT_MAX_ATTEMPTS};
pub use scheduler::{CountdownCallback, ReconnectScheduler};
