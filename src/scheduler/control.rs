//! Run settings and cancellation shared by both schedulers.

use std::time::Duration;
use tokio::sync::watch;

use crate::deploy::MonitorMode;

use super::state::FailureScope;

/// Default interval between passes.
pub const DEFAULT_PASS_INTERVAL_SECS: u64 = 5;

/// Settings of a scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Sleep between passes while stacks are in flight.
    pub poll_interval: Duration,
    /// Stop after this many passes even when stacks are still in flight.
    pub max_passes: Option<usize>,
    /// Which pending stacks a failure skips.
    pub failure_scope: FailureScope,
    /// Whether dispatched operations are awaited inside the round.
    pub monitor: MonitorMode,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_PASS_INTERVAL_SECS),
            max_passes: None,
            failure_scope: FailureScope::default(),
            monitor: MonitorMode::Detach,
        }
    }
}

/// Caller-controlled stop flag, checked before every dispatch round.
///
/// Stacks already in flight are still refreshed until they settle.
#[derive(Debug, Clone)]
pub struct CancellationSignal(watch::Receiver<bool>);

impl CancellationSignal {
    /// Creates a signal and the sender that trips it.
    #[must_use]
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self(rx))
    }

    /// A signal that never trips.
    #[must_use]
    pub fn never() -> Self {
        Self::new().1
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::never()
    }
}
