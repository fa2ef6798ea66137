//! Configuration specification types for the orchestrator.
//!
//! This module defines all the structs that map to the `stackweave.yaml`
//! manifest. Templates are referenced by path; the manifest describes the
//! graph and how each stack is deployed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::cloud::{ResourceToImport, RetryPolicy};
use crate::deploy::{DeployOptions, DeploymentMethod, HotswapMode};
use crate::scheduler::{FailureScope, SchedulerOptions};

/// The root manifest structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Toolkit resources used for template staging.
    #[serde(default)]
    pub toolkit: ToolkitConfig,
    /// Scheduler and retry settings.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Run record location.
    #[serde(default)]
    pub state: StateConfig,
    /// Stacks of the graph.
    #[serde(default)]
    pub stacks: Vec<StackConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Project name, part of every stack name.
    pub name: String,
    /// Stage (e.g., "dev", "staging", "prod").
    #[serde(default = "default_stage")]
    pub stage: String,
    /// AWS region; the default provider chain applies when unset.
    #[serde(default)]
    pub region: Option<String>,
}

/// Toolkit resources.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolkitConfig {
    /// Bucket oversized templates are staged in.
    #[serde(default)]
    pub assets_bucket: Option<String>,
    /// Key prefix inside the assets bucket.
    #[serde(default)]
    pub assets_prefix: Option<String>,
}

/// Scheduler and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettingsConfig {
    /// Seconds between passes while stacks are in flight.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Stop after this many passes.
    #[serde(default)]
    pub max_passes: Option<usize>,
    /// Which pending stacks a failure skips.
    #[serde(default)]
    pub failure_scope: FailureScope,
    /// Bound for a single wait loop.
    #[serde(default = "default_wait_timeout_secs")]
    pub wait_timeout_secs: u64,
    /// Transient-error retry.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Transient-error retry settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts per call.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Run record location.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Directory of the run record, relative to the manifest.
    #[serde(default)]
    pub dir: Option<String>,
}

/// Configuration for a single stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Short name, unique within the project.
    pub name: String,
    /// Path of the synthesized template, relative to the manifest.
    pub template: String,
    /// Short names of the stacks this one depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Role assumed by the control plane.
    #[serde(default)]
    pub role_arn: Option<String>,
    /// Stack tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Parameter values.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Roll back on failure.
    #[serde(default = "default_true")]
    pub rollback: bool,
    /// Termination protection.
    #[serde(default)]
    pub termination_protection: bool,
    /// Hotswap mode.
    #[serde(default)]
    pub hotswap: HotswapMode,
    /// Deployment protocol.
    #[serde(default)]
    pub method: DeploymentMethod,
    /// Deploy even when nothing changed.
    #[serde(default)]
    pub force: bool,
    /// Existing resources to import.
    #[serde(default)]
    pub resources_to_import: Vec<ResourceToImport>,
}

fn default_stage() -> String {
    String::from("dev")
}

const fn default_true() -> bool {
    true
}

const fn default_poll_interval_secs() -> u64 {
    crate::scheduler::DEFAULT_PASS_INTERVAL_SECS
}

const fn default_wait_timeout_secs() -> u64 {
    crate::deploy::DEFAULT_WAIT_TIMEOUT_SECS
}

const fn default_max_attempts() -> u32 {
    crate::cloud::DEFAULT_MAX_ATTEMPTS
}

const fn default_base_delay_ms() -> u64 {
    crate::cloud::DEFAULT_BASE_DELAY_MS
}

const fn default_max_delay_ms() -> u64 {
    crate::cloud::DEFAULT_MAX_DELAY_MS
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            max_passes: None,
            failure_scope: FailureScope::default(),
            wait_timeout_secs: default_wait_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl DeployConfig {
    /// Fully qualified stack name: `{stage}-{project}-{stack}`.
    #[must_use]
    pub fn stack_name(&self, short: &str) -> String {
        format!("{}-{}-{short}", self.project.stage, self.project.name)
    }

    /// Finds a stack by short name.
    #[must_use]
    pub fn find_stack(&self, name: &str) -> Option<&StackConfig> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Short names of all stacks, in manifest order.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.iter().map(|s| s.name.as_str()).collect()
    }
}

impl SettingsConfig {
    /// Retry policy for control-plane calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    /// Scheduler options for a run.
    #[must_use]
    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_passes: self.max_passes,
            failure_scope: self.failure_scope,
            ..SchedulerOptions::default()
        }
    }

    /// Bound for a single wait loop.
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

impl StackConfig {
    /// Deployment options for this stack.
    #[must_use]
    pub fn deploy_options(&self) -> DeployOptions {
        DeployOptions {
            role_arn: self.role_arn.clone(),
            tags: self.tags.clone(),
            parameters: self.parameters.clone(),
            rollback: self.rollback,
            termination_protection: self.termination_protection,
            hotswap: self.hotswap,
            method: self.method.clone(),
            force: self.force,
            resources_to_import: self.resources_to_import.clone(),
        }
    }
}
