//! Control-plane types and data structures.
//!
//! These types are the provider-neutral view of stacks, events and change
//! sets exchanged with a [`ControlPlaneClient`](super::ControlPlaneClient).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource type of the stack itself in the event stream.
pub const STACK_RESOURCE_TYPE: &str = "AWS::CloudFormation::Stack";

/// Capabilities acknowledged on every create, update and change set.
pub const CAPABILITIES: [&str; 3] = [
    "CAPABILITY_IAM",
    "CAPABILITY_NAMED_IAM",
    "CAPABILITY_AUTO_EXPAND",
];

/// Status string reported by the control plane for a stack or resource.
///
/// Statuses are kept as strings so unknown values reported by the provider
/// still flow through; the helpers classify them by suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteStackStatus(String);

impl RemoteStackStatus {
    /// Wraps a raw status string.
    #[must_use]
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    /// Returns the raw status string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// An operation is still running.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.0.ends_with("_IN_PROGRESS")
    }

    /// The stack never finished being created and must be deleted before
    /// it can be deployed again.
    #[must_use]
    pub fn is_creation_failure(&self) -> bool {
        self.0 == "ROLLBACK_COMPLETE" || self.0 == "ROLLBACK_FAILED"
    }

    /// The last operation ended in a failed state.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.0.ends_with("FAILED")
    }

    /// The last operation was rolled back.
    #[must_use]
    pub fn is_rollback(&self) -> bool {
        self.0.contains("ROLLBACK")
    }

    /// The stack is waiting on a change set created for a brand new stack.
    #[must_use]
    pub fn is_review_in_progress(&self) -> bool {
        self.0 == "REVIEW_IN_PROGRESS"
    }

    /// A create, update or import finished successfully.
    #[must_use]
    pub fn is_deploy_success(&self) -> bool {
        matches!(
            self.0.as_str(),
            "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE"
        )
    }

    /// The stack has been deleted.
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.0 == "DELETE_COMPLETE"
    }
}

impl fmt::Display for RemoteStackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteStackStatus {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A single stack output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackOutput {
    /// Output key.
    pub key: String,
    /// Output value.
    pub value: String,
    /// Export name, when the output is exported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export_name: Option<String>,
}

/// Described state of a remote stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackDescription {
    /// Stack name.
    pub name: String,
    /// Provider identifier.
    pub stack_id: String,
    /// Current status.
    pub status: RemoteStackStatus,
    /// Reason attached to the current status.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Outputs of the last successful operation.
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
    /// Stack tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Stack parameters.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Whether termination protection is enabled.
    #[serde(default)]
    pub termination_protection: bool,
}

impl StackDescription {
    /// Output values keyed by output key.
    #[must_use]
    pub fn output_map(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .map(|o| (o.key.clone(), o.value.clone()))
            .collect()
    }

    /// Output values keyed by export name, for exported outputs only.
    #[must_use]
    pub fn export_map(&self) -> BTreeMap<String, String> {
        self.outputs
            .iter()
            .filter_map(|o| {
                o.export_name
                    .as_ref()
                    .map(|name| (name.clone(), o.value.clone()))
            })
            .collect()
    }
}

/// A stack event as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackEvent {
    /// Unique event identifier.
    pub event_id: String,
    /// Stack the event belongs to.
    pub stack_name: String,
    /// When the event happened.
    pub timestamp: DateTime<Utc>,
    /// Resource type, e.g. `AWS::S3::Bucket`.
    pub resource_type: String,
    /// Resource status, e.g. `CREATE_COMPLETE`.
    pub resource_status: String,
    /// Reason attached to the status.
    #[serde(default)]
    pub resource_status_reason: Option<String>,
    /// Logical id of the resource within the template.
    pub logical_resource_id: String,
}

impl StackEvent {
    /// The event reports a failure that may be the root cause of a rollback.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.resource_status.ends_with("FAILED")
            || self.resource_status.ends_with("ROLLBACK_IN_PROGRESS")
    }

    /// The event marks the start of a stack-level operation.
    #[must_use]
    pub fn is_stack_operation_start(&self) -> bool {
        self.resource_type == STACK_RESOURCE_TYPE
            && matches!(
                self.resource_status.as_str(),
                "CREATE_IN_PROGRESS" | "UPDATE_IN_PROGRESS" | "DELETE_IN_PROGRESS"
            )
    }
}

/// Change set type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeSetType {
    /// Change set for a stack that does not exist yet.
    Create,
    /// Change set for an existing stack.
    Update,
    /// Change set importing existing resources.
    Import,
}

impl fmt::Display for ChangeSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "CREATE"),
            Self::Update => write!(f, "UPDATE"),
            Self::Import => write!(f, "IMPORT"),
        }
    }
}

/// Computation status of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeSetStatus {
    /// Still being computed.
    Pending,
    /// Ready to execute.
    Complete,
    /// Computation failed (includes "no changes").
    Failed,
}

/// Described change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetDescription {
    /// Change set identifier.
    pub change_set_id: String,
    /// Computation status.
    pub status: ChangeSetStatus,
    /// Reason attached to the status.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Number of resource changes.
    pub change_count: usize,
}

impl ChangeSetDescription {
    /// The change set computed to nothing.
    ///
    /// A change set with no changes either completes empty or fails with a
    /// reason saying it contains no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self.status {
            ChangeSetStatus::Complete => self.change_count == 0,
            ChangeSetStatus::Failed => self.status_reason.as_deref().is_some_and(|r| {
                r.contains("didn't contain changes") || r.contains("No updates are to be performed")
            }),
            ChangeSetStatus::Pending => false,
        }
    }
}

/// Where the template body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateBody {
    /// Template passed inline.
    Inline(String),
    /// Template staged in the toolkit bucket.
    Url(String),
}

/// Existing resource imported into a stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceToImport {
    /// Resource type.
    pub resource_type: String,
    /// Logical id in the template.
    pub logical_resource_id: String,
    /// Identifier properties of the existing resource.
    #[serde(default)]
    pub identifier: BTreeMap<String, String>,
}

/// Parameters shared by stack create and update calls.
#[derive(Debug, Clone)]
pub struct StackRequest {
    /// Stack name.
    pub stack_name: String,
    /// Template body.
    pub template: TemplateBody,
    /// Parameter values.
    pub parameters: BTreeMap<String, String>,
    /// Tags.
    pub tags: BTreeMap<String, String>,
    /// Role assumed by the control plane.
    pub role_arn: Option<String>,
    /// When false, a failed operation is not rolled back.
    pub rollback: bool,
    /// Termination protection applied at creation.
    pub termination_protection: bool,
    /// Idempotency token.
    pub client_token: String,
}

/// Parameters for creating a change set.
#[derive(Debug, Clone)]
pub struct ChangeSetRequest {
    /// Underlying stack request.
    pub stack: StackRequest,
    /// Change set name.
    pub change_set_name: String,
    /// Change set type.
    pub change_set_type: ChangeSetType,
    /// Resources to import for an `IMPORT` change set.
    pub resources_to_import: Vec<ResourceToImport>,
}
