//! Progress stream consumed by renderers.
//!
//! Schedulers and the deployer never print; they emit [`ProgressEvent`]s on
//! an unbounded channel. A closed or absent receiver is not an error.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::cloud::StackEvent;

use super::state::{Operation, StackState, StackStatus};

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A stack was dispatched.
    StackStarted {
        /// Stack name.
        stack: String,
        /// Operation being run.
        operation: Operation,
    },
    /// A new remote event was observed.
    ResourceEvent {
        /// Stack name.
        stack: String,
        /// The event.
        event: StackEvent,
        /// The event carries the first captured failure reason.
        first_error: bool,
    },
    /// A stack reached a terminal status.
    StackFinished {
        /// Stack name.
        stack: String,
        /// Operation that ran.
        operation: Operation,
        /// Terminal status.
        status: StackStatus,
        /// Error message for failed stacks.
        error: Option<String>,
    },
    /// A pending stack will not run.
    StackSkipped {
        /// Stack name.
        stack: String,
        /// Operation that was skipped.
        operation: Operation,
        /// Why it was skipped.
        reason: String,
    },
    /// The toolkit resources are being bootstrapped.
    Bootstrapping,
    /// A pass finished with stacks still in flight.
    Waiting {
        /// Number of the pass that just finished.
        pass: usize,
        /// Remote events observed during the pass.
        new_events: usize,
    },
}

/// Sending half of the progress stream.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink that drops every event.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { tx: None }
    }

    /// Creates a sink and its receiving half.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Emits an event.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // The renderer may have gone away; the run continues regardless.
            let _ = tx.send(event);
        }
    }

    /// Emits [`ProgressEvent::StackFinished`] for a settled stack.
    pub fn finished(&self, state: &StackState) {
        self.emit(ProgressEvent::StackFinished {
            stack: state.name.clone(),
            operation: state.operation,
            status: state.status(),
            error: state.error_message.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_reach_the_receiver_in_order() {
        let (sink, mut rx) = ProgressSink::channel();
        sink.emit(ProgressEvent::Bootstrapping);
        sink.emit(ProgressEvent::Waiting {
            pass: 1,
            new_events: 0,
        });

        assert_eq!(rx.try_recv().ok(), Some(ProgressEvent::Bootstrapping));
        assert!(matches!(rx.try_recv(), Ok(ProgressEvent::Waiting { pass: 1, .. })));
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        sink.emit(ProgressEvent::Bootstrapping);
        ProgressSink::disabled().emit(ProgressEvent::Bootstrapping);
    }
}
