//! Per-stack deployment protocol.
//!
//! The [`ChangeSetDeployer`] drives one stack through skip analysis, body
//! staging, an optional hotswap and then either a change-set or a direct
//! deployment. Every remote call goes through the [`RetryPolicy`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::{
    AssetPublisher, ChangeSetDescription, ChangeSetRequest, ChangeSetStatus, ChangeSetType,
    ControlPlaneClient, INLINE_TEMPLATE_LIMIT, RetryPolicy, StackDescription, StackRequest,
    TemplateBody, bootstrap_required,
};
use crate::error::{ControlPlaneError, DeployError, Result, StackweaveError};
use crate::scheduler::ProgressSink;

use super::hotswap::{HotswapOutcome, Hotswapper};
use super::monitor::{EventLog, StackEventMonitor};
use super::skip::{CurrentStack, DeployDecision, SkipDeployAnalyzer};
use super::spec::{DeploymentMethod, HotswapMode, StackSpec};

/// Default interval between wait-loop polls.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

/// Default bound for a single wait loop.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 3_600;

/// Whether the deployer waits for the stack to settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorMode {
    /// Poll until the stack reaches a terminal status.
    Wait,
    /// Return as soon as the operation is accepted.
    #[default]
    Detach,
}

/// Outputs of a deployed stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackOutputs {
    /// Output values by key.
    pub outputs: BTreeMap<String, String>,
    /// Exported values by export name.
    pub exports: BTreeMap<String, String>,
}

impl From<&StackDescription> for StackOutputs {
    fn from(desc: &StackDescription) -> Self {
        Self {
            outputs: desc.output_map(),
            exports: desc.export_map(),
        }
    }
}

/// Result of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Nothing was changed.
    NoOp(StackOutputs),
    /// The stack was updated and settled.
    Updated(StackOutputs),
    /// The operation was accepted and is still running.
    InProgress,
    /// A change set was created and left for review.
    ReviewPending {
        /// Change set identifier.
        change_set_id: String,
    },
}

impl fmt::Display for DeployOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp(_) => write!(f, "no changes"),
            Self::Updated(_) => write!(f, "deployed"),
            Self::InProgress => write!(f, "in progress"),
            Self::ReviewPending { change_set_id } => write!(f, "review pending ({change_set_id})"),
        }
    }
}

/// Result of a destroy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The stack did not exist.
    AlreadyGone,
    /// The stack was deleted.
    Deleted,
    /// Deletion was accepted and is still running.
    InProgress,
}

/// Classifies a described stack after a deployment was started.
///
/// Returns `Ok(None)` while the operation is still running.
///
/// # Errors
///
/// Returns the terminal deployment error: a vanished stack, a failed
/// creation, or any other non-successful terminal status annotated with the
/// first failure reason captured in `log`.
pub fn settle_deploy(
    stack: &str,
    description: Option<&StackDescription>,
    log: &EventLog,
) -> Result<Option<StackOutputs>> {
    let Some(desc) = description else {
        return Err(DeployError::StackDisappeared {
            stack: stack.to_string(),
        }
        .into());
    };

    if desc.status.is_in_progress() {
        return Ok(None);
    }

    if desc.status.is_deploy_success() {
        return Ok(Some(StackOutputs::from(desc)));
    }

    if desc.status.is_creation_failure() {
        return Err(DeployError::CreationFailed {
            stack: stack.to_string(),
            status: desc.status.to_string(),
        }
        .into());
    }

    Err(DeployError::StackOperationFailed {
        stack: stack.to_string(),
        action: String::from("deploy"),
        status: desc.status.to_string(),
        reason: log.latest_error_message().map(str::to_string),
    }
    .into())
}

/// Classifies a described stack after a deletion was started.
///
/// Returns `Ok(true)` once the stack is gone and `Ok(false)` while the
/// deletion is still running.
///
/// # Errors
///
/// Returns [`DeployError::StackOperationFailed`] for any other terminal
/// status.
pub fn settle_destroy(
    stack: &str,
    description: Option<&StackDescription>,
    log: &EventLog,
) -> Result<bool> {
    let Some(desc) = description else {
        return Ok(true);
    };

    if desc.status.is_deleted() {
        return Ok(true);
    }

    if desc.status.is_in_progress() {
        return Ok(false);
    }

    Err(DeployError::StackOperationFailed {
        stack: stack.to_string(),
        action: String::from("destroy"),
        status: desc.status.to_string(),
        reason: log.latest_error_message().map(str::to_string),
    }
    .into())
}

/// Drives one stack through its deployment protocol.
pub struct ChangeSetDeployer {
    client: Arc<dyn ControlPlaneClient>,
    assets: Option<Arc<dyn AssetPublisher>>,
    hotswapper: Hotswapper,
    retry: RetryPolicy,
    analyzer: SkipDeployAnalyzer,
    poll_interval: Duration,
    wait_timeout: Duration,
    sink: ProgressSink,
}

impl fmt::Debug for ChangeSetDeployer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSetDeployer")
            .field("backend", &self.client.backend_name())
            .field("assets", &self.assets.is_some())
            .field("hotswapper", &self.hotswapper)
            .field("retry", &self.retry)
            .field("poll_interval", &self.poll_interval)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl ChangeSetDeployer {
    /// Creates a deployer with default settings.
    #[must_use]
    pub fn new(client: Arc<dyn ControlPlaneClient>) -> Self {
        Self {
            client,
            assets: None,
            hotswapper: Hotswapper::new(),
            retry: RetryPolicy::default(),
            analyzer: SkipDeployAnalyzer::new(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            wait_timeout: Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS),
            sink: ProgressSink::disabled(),
        }
    }

    /// Sets the publisher used for oversized templates.
    #[must_use]
    pub fn with_assets(mut self, assets: Arc<dyn AssetPublisher>) -> Self {
        self.assets = Some(assets);
        self
    }

    /// Sets the hotswap patcher registry.
    #[must_use]
    pub fn with_hotswapper(mut self, hotswapper: Hotswapper) -> Self {
        self.hotswapper = hotswapper;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the interval between wait-loop polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the bound for a single wait loop.
    #[must_use]
    pub const fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    /// Sets the progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    /// The control-plane client.
    #[must_use]
    pub fn client(&self) -> &dyn ControlPlaneClient {
        self.client.as_ref()
    }

    /// The retry policy.
    #[must_use]
    pub const fn retry(&self) -> RetryPolicy {
        self.retry
    }

    /// The progress sink.
    #[must_use]
    pub const fn progress(&self) -> &ProgressSink {
        &self.sink
    }

    /// A monitor sharing this deployer's client, retry and sink.
    #[must_use]
    pub fn monitor(&self) -> StackEventMonitor<'_> {
        StackEventMonitor::new(self.client.as_ref(), self.retry, &self.sink)
    }

    /// Describes a stack with retry.
    ///
    /// # Errors
    ///
    /// Returns the control-plane error once retries are exhausted.
    pub async fn describe(&self, stack: &str) -> Result<Option<StackDescription>> {
        self.retry
            .run("describe_stack", || self.client.describe_stack(stack))
            .await
    }

    /// Deploys one stack.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::NoResources`] before any remote call when the
    /// template is empty, [`DeployError::BootstrapRequired`] when staging
    /// needs the toolkit resources, or the terminal error of the deployment.
    pub async fn deploy(
        &self,
        spec: &StackSpec,
        mode: MonitorMode,
        log: &mut EventLog,
    ) -> Result<DeployOutcome> {
        let name = spec.name.as_str();
        let options = &spec.options;

        if !spec.template.has_resources() {
            return Err(DeployError::NoResources {
                stack: name.to_string(),
            }
            .into());
        }

        if !options.resources_to_import.is_empty()
            && matches!(options.method, DeploymentMethod::Direct { .. })
        {
            return Err(DeployError::ImportRequiresChangeSet {
                stack: name.to_string(),
            }
            .into());
        }

        let mut current = self.describe(name).await?;

        if let Some(desc) = &current
            && desc.status.is_creation_failure()
        {
            info!("{name}: found stack that previously failed creation, deleting it before re-creating");
            self.delete_failed_creation(name, options.role_arn.as_deref())
                .await?;
            current = None;
        }

        let deployed_template = match &current {
            Some(_) => Some(
                self.retry
                    .run("get_template", || self.client.get_template(name))
                    .await?,
            ),
            None => None,
        };

        let current_view = current
            .as_ref()
            .zip(deployed_template.as_deref())
            .map(|(description, template)| CurrentStack {
                description,
                template,
            });

        let reason = match self.analyzer.evaluate(spec, current_view) {
            DeployDecision::Skip => {
                info!("{name}: skipping deployment, no changes");
                let outputs = current.as_ref().map(StackOutputs::from).unwrap_or_default();
                return Ok(DeployOutcome::NoOp(outputs));
            }
            DeployDecision::Deploy(reason) => reason,
        };
        debug!("{name}: deploying ({reason})");

        let body = self.prepare_body(spec).await?;

        if options.hotswap != HotswapMode::FullDeployment
            && let Some(outcome) = self
                .try_hotswap(spec, current.as_ref(), deployed_template.as_deref())
                .await?
        {
            return Ok(outcome);
        }

        let request = StackRequest {
            stack_name: name.to_string(),
            template: body,
            parameters: options.parameters.clone(),
            tags: options.tags.clone(),
            role_arn: options.role_arn.clone(),
            rollback: options.rollback,
            termination_protection: options.termination_protection,
            client_token: format!("stackweave-{}", Uuid::new_v4()),
        };

        match &options.method {
            DeploymentMethod::ChangeSet { execute, .. } => {
                self.change_set_deploy(spec, current.as_ref(), request, *execute, mode, log)
                    .await
            }
            DeploymentMethod::Direct { no_monitor } => {
                let mode = if *no_monitor { MonitorMode::Detach } else { mode };
                self.direct_deploy(spec, current.as_ref(), request, mode, log)
                    .await
            }
        }
    }

    /// Destroys one stack.
    ///
    /// # Errors
    ///
    /// Returns the terminal error when deletion does not reach
    /// `DELETE_COMPLETE`.
    pub async fn destroy(
        &self,
        stack: &str,
        role_arn: Option<&str>,
        mode: MonitorMode,
        log: &mut EventLog,
    ) -> Result<DestroyOutcome> {
        if self.describe(stack).await?.is_none() {
            info!("{stack}: stack does not exist, nothing to remove");
            return Ok(DestroyOutcome::AlreadyGone);
        }

        self.retry
            .run("delete_stack", || self.client.delete_stack(stack, role_arn))
            .await?;

        if mode == MonitorMode::Detach {
            return Ok(DestroyOutcome::InProgress);
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            match self.monitor().poll(stack, log).await {
                Ok(_) => {}
                Err(e) if e.is_stack_not_found() => return Ok(DestroyOutcome::Deleted),
                Err(e) => return Err(e),
            }

            let desc = self.describe(stack).await?;
            if settle_destroy(stack, desc.as_ref(), log)? {
                return Ok(DestroyOutcome::Deleted);
            }

            if Instant::now() > deadline {
                return Err(DeployError::WaitTimeout {
                    stack: stack.to_string(),
                    what: String::from("stack deletion"),
                }
                .into());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn prepare_body(&self, spec: &StackSpec) -> Result<TemplateBody> {
        let size = spec.template.len();
        if size <= INLINE_TEMPLATE_LIMIT {
            return Ok(TemplateBody::Inline(spec.template.raw().to_string()));
        }

        let Some(assets) = &self.assets else {
            return Err(bootstrap_required(&format!(
                "template of {size} bytes exceeds the inline limit of {INLINE_TEMPLATE_LIMIT} bytes"
            )));
        };

        debug!("{}: staging {size} byte template", spec.name);
        let url = self
            .retry
            .run("stage_template", || {
                assets.stage_template(&spec.name, spec.template.raw())
            })
            .await?;
        Ok(TemplateBody::Url(url))
    }

    /// Returns `Some` when the hotswap decided the outcome.
    async fn try_hotswap(
        &self,
        spec: &StackSpec,
        current: Option<&StackDescription>,
        deployed_template: Option<&str>,
    ) -> Result<Option<DeployOutcome>> {
        let name = spec.name.as_str();
        let hotswap_only = spec.options.hotswap == HotswapMode::HotswapOnly;

        let (Some(desc), Some(deployed)) = (current, deployed_template) else {
            if hotswap_only {
                warn!("{name}: stack does not exist yet, hotswap-only deployment left it undeployed");
                return Ok(Some(DeployOutcome::NoOp(StackOutputs::default())));
            }
            return Ok(None);
        };

        let reason = match self.hotswapper.attempt(name, deployed, &spec.template).await {
            Ok(HotswapOutcome::Applied { patched }) => {
                info!("{name}: hotswapped {}", patched.join(", "));
                return Ok(Some(DeployOutcome::Updated(StackOutputs::from(desc))));
            }
            Ok(HotswapOutcome::NotHotswappable { reason }) => reason,
            Err(StackweaveError::Deploy(DeployError::HotswapEvaluation { message, .. })) => {
                message
            }
            Err(e) => return Err(e),
        };

        if hotswap_only {
            warn!("{name}: changes could not be hotswapped and were not deployed: {reason}");
            return Ok(Some(DeployOutcome::NoOp(StackOutputs::from(desc))));
        }

        info!("{name}: falling back to a full deployment: {reason}");
        Ok(None)
    }

    async fn change_set_deploy(
        &self,
        spec: &StackSpec,
        current: Option<&StackDescription>,
        request: StackRequest,
        execute: bool,
        mode: MonitorMode,
        log: &mut EventLog,
    ) -> Result<DeployOutcome> {
        let name = spec.name.as_str();
        let change_set_name = spec.options.method.change_set_name();

        if current.is_some() {
            debug!("{name}: removing stale change set {change_set_name}");
            self.retry
                .run("delete_change_set", || {
                    self.client.delete_change_set(name, change_set_name)
                })
                .await?;
        }

        let change_set_type = if !spec.options.resources_to_import.is_empty() {
            ChangeSetType::Import
        } else if current.is_some_and(|d| !d.status.is_review_in_progress()) {
            ChangeSetType::Update
        } else {
            ChangeSetType::Create
        };

        let client_token = request.client_token.clone();
        let cs_request = ChangeSetRequest {
            stack: request,
            change_set_name: change_set_name.to_string(),
            change_set_type,
            resources_to_import: spec.options.resources_to_import.clone(),
        };

        info!("{name}: creating {change_set_type} change set {change_set_name}");
        self.retry
            .run("create_change_set", || self.client.create_change_set(&cs_request))
            .await?;

        let description = self.wait_for_change_set(name, change_set_name).await?;
        let outputs = current.map(StackOutputs::from).unwrap_or_default();

        if description.is_empty() {
            if execute {
                self.retry
                    .run("delete_change_set", || {
                        self.client.delete_change_set(name, change_set_name)
                    })
                    .await?;
            }
            if spec.options.force {
                warn!(
                    "{name}: deployment was forced, but the control plane reported that it would not make any changes"
                );
            }
            info!("{name}: no changes");
            return Ok(DeployOutcome::NoOp(outputs));
        }

        if description.status == ChangeSetStatus::Failed {
            return Err(DeployError::ChangeSetFailed {
                stack: name.to_string(),
                reason: description
                    .status_reason
                    .unwrap_or_else(|| String::from("unknown reason")),
            }
            .into());
        }

        if !execute {
            info!(
                "{name}: change set {} created and waiting for review",
                description.change_set_id
            );
            return Ok(DeployOutcome::ReviewPending {
                change_set_id: description.change_set_id,
            });
        }

        info!("{name}: executing change set {change_set_name}");
        self.retry
            .run("execute_change_set", || {
                self.client.execute_change_set(
                    name,
                    change_set_name,
                    &client_token,
                    spec.options.rollback,
                )
            })
            .await?;

        let protected = current.is_some_and(|d| d.termination_protection);
        if protected != spec.options.termination_protection {
            debug!(
                "{name}: setting termination protection to {}",
                spec.options.termination_protection
            );
            self.retry
                .run("update_termination_protection", || {
                    self.client
                        .update_termination_protection(name, spec.options.termination_protection)
                })
                .await?;
        }

        self.finish(name, mode, log).await
    }

    async fn direct_deploy(
        &self,
        spec: &StackSpec,
        current: Option<&StackDescription>,
        request: StackRequest,
        mode: MonitorMode,
        log: &mut EventLog,
    ) -> Result<DeployOutcome> {
        let name = spec.name.as_str();

        match current {
            Some(desc) if !desc.status.is_review_in_progress() => {
                if desc.termination_protection != spec.options.termination_protection {
                    self.retry
                        .run("update_termination_protection", || {
                            self.client.update_termination_protection(
                                name,
                                spec.options.termination_protection,
                            )
                        })
                        .await?;
                }

                info!("{name}: updating stack");
                let result = self
                    .retry
                    .run("update_stack", || self.client.update_stack(&request))
                    .await;

                match result {
                    Ok(_) => {}
                    Err(StackweaveError::ControlPlane(ControlPlaneError::NoUpdates { .. })) => {
                        info!("{name}: no updates are to be performed");
                        return Ok(DeployOutcome::NoOp(StackOutputs::from(desc)));
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {
                info!("{name}: creating stack");
                self.retry
                    .run("create_stack", || self.client.create_stack(&request))
                    .await?;
            }
        }

        self.finish(name, mode, log).await
    }

    async fn finish(&self, stack: &str, mode: MonitorMode, log: &mut EventLog) -> Result<DeployOutcome> {
        if mode == MonitorMode::Detach {
            return Ok(DeployOutcome::InProgress);
        }

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            match self.monitor().poll(stack, log).await {
                Ok(_) => {}
                Err(e) if e.is_stack_not_found() => {
                    return Err(DeployError::StackDisappeared {
                        stack: stack.to_string(),
                    }
                    .into());
                }
                Err(e) => return Err(e),
            }

            let desc = self.describe(stack).await?;
            if let Some(outputs) = settle_deploy(stack, desc.as_ref(), log)? {
                return Ok(DeployOutcome::Updated(outputs));
            }

            if Instant::now() > deadline {
                return Err(DeployError::WaitTimeout {
                    stack: stack.to_string(),
                    what: String::from("stack deployment"),
                }
                .into());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn wait_for_change_set(
        &self,
        stack: &str,
        change_set_name: &str,
    ) -> Result<ChangeSetDescription> {
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let description = self
                .retry
                .run("describe_change_set", || {
                    self.client.describe_change_set(stack, change_set_name)
                })
                .await?;

            if description.status != ChangeSetStatus::Pending {
                return Ok(description);
            }

            if Instant::now() > deadline {
                return Err(DeployError::WaitTimeout {
                    stack: stack.to_string(),
                    what: format!("change set {change_set_name}"),
                }
                .into());
            }

            debug!("{stack}: change set {change_set_name} still being computed");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn delete_failed_creation(&self, stack: &str, role_arn: Option<&str>) -> Result<()> {
        self.retry
            .run("delete_stack", || self.client.delete_stack(stack, role_arn))
            .await?;

        let deadline = Instant::now() + self.wait_timeout;
        loop {
            let Some(desc) = self.describe(stack).await? else {
                return Ok(());
            };

            if desc.status.is_deleted() {
                return Ok(());
            }

            if !desc.status.is_in_progress() {
                return Err(DeployError::CreationFailureCleanup {
                    stack: stack.to_string(),
                    status: desc.status.to_string(),
                }
                .into());
            }

            if Instant::now() > deadline {
                return Err(DeployError::WaitTimeout {
                    stack: stack.to_string(),
                    what: String::from("failed stack cleanup"),
                }
                .into());
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
