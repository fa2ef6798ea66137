//! Error types for the stackweave orchestrator.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, run-record persistence, the control-plane boundary,
//! per-stack deployment and scheduling.
//!
//! Control-plane errors are classified exactly once, where the SDK error is
//! converted, so the schedulers never inspect provider codes or messages.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for stackweave.
#[derive(Debug, Error)]
pub enum StackweaveError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Run-record persistence errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Control-plane API errors.
    #[error("Control plane error: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    /// Per-stack deployment errors.
    #[error("Deployment error: {0}")]
    Deploy(#[from] DeployError),

    /// Scheduling errors.
    #[error("Scheduling error: {0}")]
    Schedule(#[from] ScheduleError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration or template file was not found.
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// Duplicate stack definition.
    #[error("Duplicate stack name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// A stack depends on a stack that is not part of the graph.
    #[error("Stack '{stack}' depends on unknown stack '{dependency}'")]
    UnknownDependency {
        /// The dependent stack.
        stack: String,
        /// The missing dependency.
        dependency: String,
    },

    /// Circular dependency detected.
    #[error("Circular dependency detected: {cycle}")]
    CircularDependency {
        /// Description of the cycle.
        cycle: String,
    },

    /// A template body is not a valid JSON template document.
    #[error("Invalid template for stack '{stack}': {message}")]
    InvalidTemplate {
        /// Stack owning the template.
        stack: String,
        /// Description of the problem.
        message: String,
    },
}

/// Run-record persistence errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Writing to the state directory failed.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the storage error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Control-plane errors, classified at the client boundary.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    /// The API throttled the request.
    #[error("Request throttled: {message}")]
    Throttled {
        /// Provider message.
        message: String,
        /// Server hint for when to retry, in seconds.
        retry_after_secs: Option<u64>,
    },

    /// The request timed out.
    #[error("Request timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// The request could not be sent or the connection dropped.
    #[error("Network error: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// The stack does not exist.
    #[error("Stack {stack} does not exist")]
    StackNotFound {
        /// Stack name.
        stack: String,
    },

    /// The change set does not exist.
    #[error("Change set {change_set} does not exist on stack {stack}")]
    ChangeSetNotFound {
        /// Stack name.
        stack: String,
        /// Change set name.
        change_set: String,
    },

    /// A direct update was rejected because nothing would change.
    #[error("No updates are to be performed on stack {stack}")]
    NoUpdates {
        /// Stack name.
        stack: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("Access denied: {message}")]
    AccessDenied {
        /// Provider message.
        message: String,
    },

    /// The request was rejected as invalid.
    #[error("Validation error: {message}")]
    Validation {
        /// Provider message.
        message: String,
    },

    /// Any other API error.
    #[error("API error {code}: {message}")]
    Api {
        /// Provider error code.
        code: String,
        /// Provider message.
        message: String,
    },

    /// The response was missing required data.
    #[error("Invalid response from control plane: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// Per-stack deployment errors.
#[derive(Debug, Error)]
pub enum DeployError {
    /// The template declares no resources; nothing can be deployed.
    #[error("The {stack} stack contains no resources.")]
    NoResources {
        /// Stack name.
        stack: String,
    },

    /// The toolkit (bootstrap) resources are missing or outdated.
    #[error("{message}")]
    BootstrapRequired {
        /// Description of what is missing.
        message: String,
    },

    /// A stack that failed creation could not be cleaned up.
    #[error("Failed deleting stack {stack} that had previously failed creation (current state: {status})")]
    CreationFailureCleanup {
        /// Stack name.
        stack: String,
        /// Status reached instead of `DELETE_COMPLETE`.
        status: String,
    },

    /// The change set could not be computed.
    #[error("Change set for stack {stack} failed: {reason}")]
    ChangeSetFailed {
        /// Stack name.
        stack: String,
        /// Status reason reported by the control plane.
        reason: String,
    },

    /// The stack reached a failed terminal status.
    #[error("The stack named {stack} failed to {action}: {status}{}", reason.as_deref().map(|r| format!(": {r}")).unwrap_or_default())]
    StackOperationFailed {
        /// Stack name.
        stack: String,
        /// Verb describing the operation ("deploy", "destroy").
        action: String,
        /// Terminal status reached.
        status: String,
        /// First captured failure reason, if any.
        reason: Option<String>,
    },

    /// The stack failed its initial creation and needs manual cleanup.
    #[error("The stack named {stack} failed creation, it may need to be manually deleted from the AWS console: {status}")]
    CreationFailed {
        /// Stack name.
        stack: String,
        /// Terminal status reached.
        status: String,
    },

    /// The stack vanished while it was being deployed.
    #[error("The stack named {stack} failed to deploy, it is removed while deploying.")]
    StackDisappeared {
        /// Stack name.
        stack: String,
    },

    /// Importing resources requires the change-set method.
    #[error("Importing resources into stack {stack} requires a change set deployment")]
    ImportRequiresChangeSet {
        /// Stack name.
        stack: String,
    },

    /// Staging an oversized template failed.
    #[error("Failed to stage template for stack {stack}: {message}")]
    AssetStaging {
        /// Stack name.
        stack: String,
        /// Description of the failure.
        message: String,
    },

    /// A hotswap could not evaluate the template changes.
    #[error("Could not evaluate hotswap changes for stack {stack}: {message}")]
    HotswapEvaluation {
        /// Stack name.
        stack: String,
        /// Description of the evaluation failure.
        message: String,
    },

    /// A wait loop gave up before the control plane reached a terminal state.
    #[error("Timed out waiting for {what} on stack {stack}")]
    WaitTimeout {
        /// Stack name.
        stack: String,
        /// What was being awaited.
        what: String,
    },
}

/// Scheduling errors.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// Maximum retry attempts exceeded for a transient error.
    #[error("Maximum retry attempts ({attempts}) exceeded for {operation}: {last_error}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Operation that kept failing.
        operation: String,
        /// The last transient error observed.
        last_error: String,
    },

    /// A stack status transition violated the state machine.
    #[error("Invalid status transition for stack {stack}: {from} -> {to}")]
    InvalidTransition {
        /// Stack name.
        stack: String,
        /// Current status.
        from: String,
        /// Requested status.
        to: String,
    },

    /// The fixed-point loop did not converge within its guard.
    #[error("Dispatch did not converge after {rounds} rounds")]
    RoundLimitExceeded {
        /// Rounds executed.
        rounds: usize,
    },

    /// The run was aborted.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for stackweave operations.
pub type Result<T> = std::result::Result<T, StackweaveError>;

impl StackweaveError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Message of the wrapped error without its category prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Config(e) => e.to_string(),
            Self::State(e) => e.to_string(),
            Self::ControlPlane(e) => e.to_string(),
            Self::Deploy(e) => e.to_string(),
            Self::Schedule(e) => e.to_string(),
            Self::Io(e) => e.to_string(),
            Self::Internal(message) => message.clone(),
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ControlPlane(
                ControlPlaneError::Throttled { .. }
                    | ControlPlaneError::Timeout { .. }
                    | ControlPlaneError::Network { .. }
            ) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns true if the error may clear up on its own.
    ///
    /// Covers retryable errors and retry exhaustion, which only ever wraps a
    /// retryable error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.is_retryable()
            || matches!(self, Self::Schedule(ScheduleError::MaxRetriesExceeded { .. }))
    }

    /// Returns the suggested retry delay in seconds, if the error carries a hint.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::ControlPlane(ControlPlaneError::Throttled { retry_after_secs, .. }) => {
                *retry_after_secs
            }
            Self::State(StateError::LockFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true if the error means the stack does not exist.
    #[must_use]
    pub const fn is_stack_not_found(&self) -> bool {
        matches!(self, Self::ControlPlane(ControlPlaneError::StackNotFound { .. }))
    }

    /// Returns true if the error asks for the toolkit resources to be bootstrapped.
    #[must_use]
    pub const fn is_bootstrap_required(&self) -> bool {
        matches!(self, Self::Deploy(DeployError::BootstrapRequired { .. }))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl ControlPlaneError {
    /// Creates an API error.
    #[must_use]
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Creates a throttling error without a retry hint.
    #[must_use]
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
            retry_after_secs: None,
        }
    }

    /// Creates a stack-not-found error.
    #[must_use]
    pub fn stack_not_found(stack: impl Into<String>) -> Self {
        Self::StackNotFound {
            stack: stack.into(),
        }
    }
}
