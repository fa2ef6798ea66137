//! Remote control-plane integration.
//!
//! This module provides the boundary to the cloud control plane:
//! - The [`ControlPlaneClient`] trait and its CloudFormation implementation
//! - Error classification and bounded retry
//! - Template staging and toolkit bootstrap

mod types;
mod client;
mod cloudformation;
mod retry;
mod assets;

#[cfg(test)]
pub mod fake;

pub use types::{
    CAPABILITIES, ChangeSetDescription, ChangeSetRequest, ChangeSetStatus, ChangeSetType,
    RemoteStackStatus, ResourceToImport, STACK_RESOURCE_TYPE, StackDescription, StackEvent,
    StackOutput, StackRequest, TemplateBody,
};
pub use client::ControlPlaneClient;
pub use cloudformation::{CloudFormationClient, classify_code, load_aws_config};
pub use retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, RetryPolicy};
pub use assets::{
    AssetPublisher, BOOTSTRAP_REQUIRED_PREFIX, Bootstrapper, INLINE_TEMPLATE_LIMIT,
    S3AssetPublisher, bootstrap_required,
};
