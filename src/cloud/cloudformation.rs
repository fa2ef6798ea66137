//! AWS CloudFormation implementation of the control-plane client.
//!
//! This is the only module that sees SDK types. Every error leaves it
//! already classified as a [`ControlPlaneError`].

use async_trait::async_trait;
use aws_sdk_cloudformation::Client;
use aws_sdk_cloudformation::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_cloudformation::types::{
    Capability, ChangeSetStatus as CfnChangeSetStatus, ChangeSetType as CfnChangeSetType,
    Parameter, ResourceToImport as CfnResourceToImport, Tag, TemplateStage,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, trace};

use crate::error::{ControlPlaneError, Result, StackweaveError};

use super::client::ControlPlaneClient;
use super::types::{
    CAPABILITIES, ChangeSetDescription, ChangeSetRequest, ChangeSetStatus, ChangeSetType,
    RemoteStackStatus, StackDescription, StackEvent, StackOutput, StackRequest, TemplateBody,
};

/// CloudFormation control-plane client.
#[derive(Debug, Clone)]
pub struct CloudFormationClient {
    /// SDK client.
    client: Client,
}

impl CloudFormationClient {
    /// Creates a client from the shared AWS configuration.
    #[must_use]
    pub fn new(config: &aws_config::SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }

    /// Creates a client with an existing SDK client.
    #[must_use]
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

/// Loads the shared AWS configuration, optionally pinned to a region.
pub async fn load_aws_config(region: Option<&str>) -> aws_config::SdkConfig {
    if let Some(region_str) = region {
        aws_config::from_env()
            .region(aws_config::Region::new(region_str.to_string()))
            .load()
            .await
    } else {
        aws_config::load_from_env().await
    }
}

/// Classifies a provider error code and message.
///
/// `stack` is used to fill not-found errors.
#[must_use]
pub fn classify_code(code: &str, message: &str, stack: &str) -> ControlPlaneError {
    match code {
        "Throttling" | "ThrottlingException" | "TooManyRequestsException"
        | "RequestLimitExceeded" | "OperationAbortedException" | "SlowDown" => {
            ControlPlaneError::Throttled {
                message: message.to_string(),
                retry_after_secs: None,
            }
        }
        "RequestTimeout" | "RequestTimeoutException" | "TimeoutError" => {
            ControlPlaneError::Timeout {
                message: message.to_string(),
            }
        }
        "NetworkingError" => ControlPlaneError::network(message),
        "ChangeSetNotFound" | "ChangeSetNotFoundException" => {
            ControlPlaneError::ChangeSetNotFound {
                stack: stack.to_string(),
                change_set: String::new(),
            }
        }
        "AccessDenied" | "AccessDeniedException" | "ExpiredToken" | "InvalidClientTokenId" => {
            ControlPlaneError::AccessDenied {
                message: message.to_string(),
            }
        }
        "ValidationError" if message.contains("does not exist") && message.contains("Stack") => {
            ControlPlaneError::stack_not_found(stack)
        }
        "ValidationError" if message.contains("No updates are to be performed") => {
            ControlPlaneError::NoUpdates {
                stack: stack.to_string(),
            }
        }
        "ValidationError" => ControlPlaneError::Validation {
            message: message.to_string(),
        },
        _ => ControlPlaneError::api(code, message),
    }
}

/// Classifies an SDK error from any AWS service client.
///
/// `stack` is used to fill not-found errors.
pub(super) fn classify<E, R>(err: &SdkError<E, R>, stack: &str) -> StackweaveError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let classified = match err {
        SdkError::TimeoutError(_) => ControlPlaneError::Timeout {
            message: String::from("request timed out"),
        },
        SdkError::DispatchFailure(failure) if failure.is_timeout() => ControlPlaneError::Timeout {
            message: format!("{failure:?}"),
        },
        SdkError::DispatchFailure(failure) => ControlPlaneError::network(format!("{failure:?}")),
        SdkError::ResponseError(_) => ControlPlaneError::network("malformed response"),
        _ => classify_code(
            err.code().unwrap_or("Unknown"),
            err.message().unwrap_or_default(),
            stack,
        ),
    };
    trace!("Classified control-plane error for {stack}: {classified}");
    StackweaveError::ControlPlane(classified)
}

fn to_chrono(ts: &aws_sdk_cloudformation::primitives::DateTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos()).unwrap_or_default()
}

fn parameters(values: &BTreeMap<String, String>) -> Vec<Parameter> {
    values
        .iter()
        .map(|(k, v)| {
            Parameter::builder()
                .parameter_key(k)
                .parameter_value(v)
                .build()
        })
        .collect()
}

fn tags(values: &BTreeMap<String, String>) -> Result<Vec<Tag>> {
    values
        .iter()
        .map(|(k, v)| {
            Tag::builder().key(k).value(v).build().map_err(|e| {
                StackweaveError::ControlPlane(ControlPlaneError::Validation {
                    message: format!("invalid tag {k}: {e}"),
                })
            })
        })
        .collect()
}

fn capabilities() -> Vec<Capability> {
    CAPABILITIES.iter().map(|c| Capability::from(*c)).collect()
}

#[async_trait]
impl ControlPlaneClient for CloudFormationClient {
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>> {
        let result = self
            .client
            .describe_stacks()
            .stack_name(stack_name)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let err = classify(&e, stack_name);
                if err.is_stack_not_found() {
                    return Ok(None);
                }
                return Err(err);
            }
        };

        let Some(stack) = output.stacks().first() else {
            return Ok(None);
        };

        let status = RemoteStackStatus::new(stack.stack_status().as_str());

        // A deleted stack is still listed when described by id.
        if status.is_deleted() {
            return Ok(None);
        }

        Ok(Some(StackDescription {
            name: stack.stack_name().to_string(),
            stack_id: stack.stack_id().unwrap_or_default().to_string(),
            status,
            status_reason: stack.stack_status_reason().map(str::to_string),
            outputs: stack
                .outputs()
                .iter()
                .filter_map(|o| {
                    Some(StackOutput {
                        key: o.output_key()?.to_string(),
                        value: o.output_value().unwrap_or_default().to_string(),
                        export_name: o.export_name().map(str::to_string),
                    })
                })
                .collect(),
            tags: stack
                .tags()
                .iter()
                .map(|t| (t.key().to_string(), t.value().to_string()))
                .collect(),
            parameters: stack
                .parameters()
                .iter()
                .filter_map(|p| {
                    Some((
                        p.parameter_key()?.to_string(),
                        p.parameter_value().unwrap_or_default().to_string(),
                    ))
                })
                .collect(),
            termination_protection: stack.enable_termination_protection().unwrap_or(false),
        }))
    }

    async fn get_template(&self, stack_name: &str) -> Result<String> {
        let output = self
            .client
            .get_template()
            .stack_name(stack_name)
            .template_stage(TemplateStage::Original)
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        Ok(output.template_body().unwrap_or("{}").to_string())
    }

    async fn describe_stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
        let output = self
            .client
            .describe_stack_events()
            .stack_name(stack_name)
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        Ok(output
            .stack_events()
            .iter()
            .map(|e| StackEvent {
                event_id: e.event_id().to_string(),
                stack_name: e.stack_name().to_string(),
                timestamp: to_chrono(e.timestamp()),
                resource_type: e.resource_type().unwrap_or_default().to_string(),
                resource_status: e
                    .resource_status()
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                resource_status_reason: e.resource_status_reason().map(str::to_string),
                logical_resource_id: e.logical_resource_id().unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String> {
        debug!("CreateStack {}", request.stack_name);

        let mut call = self
            .client
            .create_stack()
            .stack_name(&request.stack_name)
            .set_parameters(Some(parameters(&request.parameters)))
            .set_tags(Some(tags(&request.tags)?))
            .set_capabilities(Some(capabilities()))
            .set_role_arn(request.role_arn.clone())
            .disable_rollback(!request.rollback)
            .enable_termination_protection(request.termination_protection)
            .client_request_token(&request.client_token);

        call = match &request.template {
            TemplateBody::Inline(body) => call.template_body(body),
            TemplateBody::Url(url) => call.template_url(url),
        };

        let output = call
            .send()
            .await
            .map_err(|e| classify(&e, &request.stack_name))?;

        Ok(output.stack_id().unwrap_or_default().to_string())
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<String> {
        debug!("UpdateStack {}", request.stack_name);

        let mut call = self
            .client
            .update_stack()
            .stack_name(&request.stack_name)
            .set_parameters(Some(parameters(&request.parameters)))
            .set_tags(Some(tags(&request.tags)?))
            .set_capabilities(Some(capabilities()))
            .set_role_arn(request.role_arn.clone())
            .disable_rollback(!request.rollback)
            .client_request_token(&request.client_token);

        call = match &request.template {
            TemplateBody::Inline(body) => call.template_body(body),
            TemplateBody::Url(url) => call.template_url(url),
        };

        let output = call
            .send()
            .await
            .map_err(|e| classify(&e, &request.stack_name))?;

        Ok(output.stack_id().unwrap_or_default().to_string())
    }

    async fn delete_stack(&self, stack_name: &str, role_arn: Option<&str>) -> Result<()> {
        debug!("DeleteStack {stack_name}");

        self.client
            .delete_stack()
            .stack_name(stack_name)
            .set_role_arn(role_arn.map(str::to_string))
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        Ok(())
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<String> {
        let stack = &request.stack;
        debug!(
            "CreateChangeSet {} ({}) on {}",
            request.change_set_name, request.change_set_type, stack.stack_name
        );

        let change_set_type = match request.change_set_type {
            ChangeSetType::Create => CfnChangeSetType::Create,
            ChangeSetType::Update => CfnChangeSetType::Update,
            ChangeSetType::Import => CfnChangeSetType::Import,
        };

        let imports = request
            .resources_to_import
            .iter()
            .map(|r| {
                CfnResourceToImport::builder()
                    .resource_type(&r.resource_type)
                    .logical_resource_id(&r.logical_resource_id)
                    .set_resource_identifier(Some(
                        r.identifier
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    ))
                    .build()
                    .map_err(|e| {
                        StackweaveError::ControlPlane(ControlPlaneError::Validation {
                            message: format!(
                                "invalid resource to import {}: {e}",
                                r.logical_resource_id
                            ),
                        })
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut call = self
            .client
            .create_change_set()
            .stack_name(&stack.stack_name)
            .change_set_name(&request.change_set_name)
            .change_set_type(change_set_type)
            .set_parameters(Some(parameters(&stack.parameters)))
            .set_tags(Some(tags(&stack.tags)?))
            .set_capabilities(Some(capabilities()))
            .set_role_arn(stack.role_arn.clone())
            .client_token(&stack.client_token)
            .description(format!("stackweave change set for {}", stack.stack_name));

        if !imports.is_empty() {
            call = call.set_resources_to_import(Some(imports));
        }

        call = match &stack.template {
            TemplateBody::Inline(body) => call.template_body(body),
            TemplateBody::Url(url) => call.template_url(url),
        };

        let output = call
            .send()
            .await
            .map_err(|e| classify(&e, &stack.stack_name))?;

        Ok(output.id().unwrap_or_default().to_string())
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<ChangeSetDescription> {
        let output = self
            .client
            .describe_change_set()
            .stack_name(stack_name)
            .change_set_name(change_set_name)
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        let status = match output.status() {
            Some(CfnChangeSetStatus::CreateComplete) => ChangeSetStatus::Complete,
            Some(CfnChangeSetStatus::Failed | CfnChangeSetStatus::DeleteFailed) => {
                ChangeSetStatus::Failed
            }
            Some(CfnChangeSetStatus::DeleteComplete) => {
                return Err(StackweaveError::ControlPlane(
                    ControlPlaneError::ChangeSetNotFound {
                        stack: stack_name.to_string(),
                        change_set: change_set_name.to_string(),
                    },
                ));
            }
            _ => ChangeSetStatus::Pending,
        };

        Ok(ChangeSetDescription {
            change_set_id: output.change_set_id().unwrap_or_default().to_string(),
            status,
            status_reason: output.status_reason().map(str::to_string),
            change_count: output.changes().len(),
        })
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_token: &str,
        rollback: bool,
    ) -> Result<()> {
        debug!("ExecuteChangeSet {change_set_name} on {stack_name}");

        self.client
            .execute_change_set()
            .stack_name(stack_name)
            .change_set_name(change_set_name)
            .client_request_token(client_token)
            .disable_rollback(!rollback)
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        Ok(())
    }

    async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()> {
        let result = self
            .client
            .delete_change_set()
            .stack_name(stack_name)
            .change_set_name(change_set_name)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = classify(&e, stack_name);
                if matches!(
                    err,
                    StackweaveError::ControlPlane(
                        ControlPlaneError::ChangeSetNotFound { .. }
                            | ControlPlaneError::StackNotFound { .. }
                    )
                ) {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn update_termination_protection(&self, stack_name: &str, enabled: bool) -> Result<()> {
        debug!("UpdateTerminationProtection {stack_name} -> {enabled}");

        self.client
            .update_termination_protection()
            .stack_name(stack_name)
            .enable_termination_protection(enabled)
            .send()
            .await
            .map_err(|e| classify(&e, stack_name))?;

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "cloudformation"
    }
}
