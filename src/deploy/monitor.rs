//! Incremental stack event monitoring.
//!
//! Events are polled newest first from the control plane, filtered against
//! a watermark so events of earlier operations are ignored, deduplicated by
//! id and appended oldest first to the stack's [`EventLog`].

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::cloud::{ControlPlaneClient, RetryPolicy, StackEvent};
use crate::error::Result;
use crate::scheduler::{ProgressEvent, ProgressSink};

/// Seconds between the watermark and the stack-level start event.
pub const WATERMARK_LEAD_SECS: i64 = 5;

/// Reasons that follow a root cause rather than being one.
const CASCADE_REASONS: [&str; 3] = [
    "Resource creation cancelled",
    "Resource update cancelled",
    "Resource creation Initiated",
];

/// Prefix of the stack-level summary reason emitted on rollback.
const CASCADE_SUMMARY_PREFIX: &str = "The following resource(s) failed to";

fn is_cascade_noise(reason: &str) -> bool {
    CASCADE_REASONS.contains(&reason) || reason.starts_with(CASCADE_SUMMARY_PREFIX)
}

/// Events observed for one stack during a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventLog {
    events: Vec<StackEvent>,
    #[serde(skip)]
    seen: HashSet<String>,
    latest_error_message: Option<String>,
    first_event_at: Option<DateTime<Utc>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded events, oldest first.
    #[must_use]
    pub fn events(&self) -> &[StackEvent] {
        &self.events
    }

    /// First failure reason captured, if any.
    #[must_use]
    pub fn latest_error_message(&self) -> Option<&str> {
        self.latest_error_message.as_deref()
    }

    /// Events older than this are ignored.
    #[must_use]
    pub const fn first_event_at(&self) -> Option<DateTime<Utc>> {
        self.first_event_at
    }

    /// Number of recorded events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether no event has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Absorbs a newest-first batch of remote events and returns how many
    /// were new.
    pub fn absorb(&mut self, stack: &str, remote: &[StackEvent], sink: &ProgressSink) -> usize {
        if self.first_event_at.is_none() {
            self.first_event_at = remote
                .iter()
                .find(|e| e.is_stack_operation_start())
                .map(|e| e.timestamp - Duration::seconds(WATERMARK_LEAD_SECS));
        }

        let Some(watermark) = self.first_event_at else {
            debug!("{stack}: no stack operation started yet, ignoring {} events", remote.len());
            return 0;
        };

        let mut added = 0;
        for event in remote.iter().rev() {
            if event.timestamp < watermark || self.seen.contains(&event.event_id) {
                continue;
            }

            let mut first_error = false;
            if event.is_error()
                && self.latest_error_message.is_none()
                && let Some(reason) = event.resource_status_reason.as_deref()
                && !is_cascade_noise(reason)
            {
                warn!("{stack}: {} {} {reason}", event.logical_resource_id, event.resource_status);
                self.latest_error_message = Some(reason.to_string());
                first_error = true;
            }

            self.seen.insert(event.event_id.clone());
            self.events.push(event.clone());
            added += 1;

            sink.emit(ProgressEvent::ResourceEvent {
                stack: stack.to_string(),
                event: event.clone(),
                first_error,
            });
        }

        added
    }
}

/// Polls remote events into an [`EventLog`].
pub struct StackEventMonitor<'a> {
    client: &'a dyn ControlPlaneClient,
    retry: RetryPolicy,
    sink: &'a ProgressSink,
}

impl<'a> StackEventMonitor<'a> {
    /// Creates a monitor.
    #[must_use]
    pub fn new(client: &'a dyn ControlPlaneClient, retry: RetryPolicy, sink: &'a ProgressSink) -> Self {
        Self {
            client,
            retry,
            sink,
        }
    }

    /// Fetches the latest events for `stack` and absorbs them into `log`.
    ///
    /// # Errors
    ///
    /// Returns the control-plane error, including
    /// [`ControlPlaneError::StackNotFound`](crate::error::ControlPlaneError::StackNotFound)
    /// once the stack is gone.
    pub async fn poll(&self, stack: &str, log: &mut EventLog) -> Result<usize> {
        let remote = self
            .retry
            .run("describe_stack_events", || self.client.describe_stack_events(stack))
            .await?;
        Ok(log.absorb(stack, &remote, self.sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::STACK_RESOURCE_TYPE;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).single().expect("valid time") + Duration::seconds(secs)
    }

    fn event(id: &str, secs: i64, resource_type: &str, status: &str, reason: Option<&str>) -> StackEvent {
        StackEvent {
            event_id: id.to_string(),
            stack_name: String::from("app"),
            timestamp: at(secs),
            resource_type: resource_type.to_string(),
            resource_status: status.to_string(),
            resource_status_reason: reason.map(str::to_string),
            logical_resource_id: id.to_string(),
        }
    }

    fn newest_first(mut events: Vec<StackEvent>) -> Vec<StackEvent> {
        events.reverse();
        events
    }

    #[test]
    fn test_watermark_excludes_previous_operations() {
        let remote = newest_first(vec![
            event("old-start", 0, STACK_RESOURCE_TYPE, "CREATE_IN_PROGRESS", None),
            event("old-done", 10, STACK_RESOURCE_TYPE, "CREATE_COMPLETE", None),
            event("pre", 97, "AWS::S3::Bucket", "UPDATE_COMPLETE", None),
            event("start", 100, STACK_RESOURCE_TYPE, "UPDATE_IN_PROGRESS", None),
            event("bucket", 102, "AWS::S3::Bucket", "UPDATE_COMPLETE", None),
        ]);

        let mut log = EventLog::new();
        let added = log.absorb("app", &remote, &ProgressSink::disabled());

        assert_eq!(added, 3);
        assert_eq!(log.first_event_at(), Some(at(95)));
        let ids: Vec<_> = log.events().iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["pre", "start", "bucket"]);
    }

    #[test]
    fn test_events_are_deduplicated_across_polls() {
        let first = newest_first(vec![event("start", 0, STACK_RESOURCE_TYPE, "UPDATE_IN_PROGRESS", None)]);
        let second = newest_first(vec![
            event("start", 0, STACK_RESOURCE_TYPE, "UPDATE_IN_PROGRESS", None),
            event("bucket", 3, "AWS::S3::Bucket", "UPDATE_COMPLETE", None),
        ]);

        let mut log = EventLog::new();
        let sink = ProgressSink::disabled();
        assert_eq!(log.absorb("app", &first, &sink), 1);
        assert_eq!(log.absorb("app", &second, &sink), 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_first_error_is_captured_once_and_skips_cascade_noise() {
        let remote = newest_first(vec![
            event("start", 0, STACK_RESOURCE_TYPE, "UPDATE_IN_PROGRESS", None),
            event("cancel", 1, "AWS::SQS::Queue", "UPDATE_FAILED", Some("Resource update cancelled")),
            event("bucket", 2, "AWS::S3::Bucket", "UPDATE_FAILED", Some("Bucket name taken")),
            event("other", 3, "AWS::SNS::Topic", "UPDATE_FAILED", Some("Topic limit")),
            event(
                "rollback",
                4,
                STACK_RESOURCE_TYPE,
                "UPDATE_ROLLBACK_IN_PROGRESS",
                Some("The following resource(s) failed to update: [bucket]."),
            ),
        ]);

        let (sink, mut rx) = ProgressSink::channel();
        let mut log = EventLog::new();
        log.absorb("app", &remote, &sink);

        assert_eq!(log.latest_error_message(), Some("Bucket name taken"));

        let mut flagged = Vec::new();
        while let Ok(ProgressEvent::ResourceEvent { event, first_error, .. }) = rx.try_recv() {
            if first_error {
                flagged.push(event.event_id);
            }
        }
        assert_eq!(flagged, vec![String::from("bucket")]);
    }

    #[test]
    fn test_no_stack_start_means_nothing_recorded() {
        let remote = vec![event("bucket", 3, "AWS::S3::Bucket", "CREATE_COMPLETE", None)];
        let mut log = EventLog::new();
        assert_eq!(log.absorb("app", &remote, &ProgressSink::disabled()), 0);
        assert!(log.is_empty());
    }
}
