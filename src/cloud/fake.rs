//! Scripted in-memory control plane for tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{ControlPlaneError, Result, StackweaveError};

use super::client::ControlPlaneClient;
use super::types::{
    ChangeSetDescription, ChangeSetRequest, ChangeSetStatus, ChangeSetType, RemoteStackStatus,
    STACK_RESOURCE_TYPE, StackDescription, StackEvent, StackOutput, StackRequest, TemplateBody,
};

/// Operations that change remote state.
pub const MUTATING_OPERATIONS: [&str; 7] = [
    "create_stack",
    "update_stack",
    "delete_stack",
    "create_change_set",
    "execute_change_set",
    "delete_change_set",
    "update_termination_protection",
];

/// A recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Operation name.
    pub operation: &'static str,
    /// Stack the call targeted.
    pub stack: String,
}

#[derive(Debug, Clone)]
struct FakeStack {
    description: StackDescription,
    template: String,
    events: Vec<StackEvent>,
    /// Describes left before an in-progress operation settles.
    polls_left: u32,
    /// Status reached once the in-progress operation settles.
    settles_to: Option<RemoteStackStatus>,
}

#[derive(Debug, Clone)]
struct PendingChangeSet {
    change_set_type: ChangeSetType,
    template: String,
    tags: BTreeMap<String, String>,
    parameters: BTreeMap<String, String>,
    change_count: usize,
}

#[derive(Debug, Default)]
struct Inner {
    stacks: BTreeMap<String, FakeStack>,
    change_sets: BTreeMap<(String, String), PendingChangeSet>,
    calls: Vec<Call>,
    deploy_failures: HashMap<String, String>,
    delete_failures: HashMap<String, String>,
    throttles: HashMap<(&'static str, String), u32>,
    injected: HashMap<(&'static str, String), String>,
    outputs: HashMap<String, Vec<StackOutput>>,
    settle_polls: u32,
    clock: i64,
    next_event: u64,
}

/// In-memory control plane with scripted failures.
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    inner: Mutex<Inner>,
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap_or_default()
}

fn body_of(template: &TemplateBody) -> String {
    match template {
        TemplateBody::Inline(body) => body.clone(),
        TemplateBody::Url(url) => format!("url:{url}"),
    }
}

impl Inner {
    fn tick(&mut self) -> DateTime<Utc> {
        self.clock += 1;
        base_time() + ChronoDuration::seconds(self.clock)
    }

    /// Leaves a gap so earlier operations fall outside a new watermark.
    fn start_operation(&mut self) {
        self.clock += 60;
    }

    fn push_event(
        &mut self,
        stack: &str,
        resource_type: &str,
        logical_id: &str,
        status: &str,
        reason: Option<&str>,
    ) {
        self.next_event += 1;
        let event = StackEvent {
            event_id: format!("evt-{}", self.next_event),
            stack_name: stack.to_string(),
            timestamp: self.tick(),
            resource_type: resource_type.to_string(),
            resource_status: status.to_string(),
            resource_status_reason: reason.map(str::to_string),
            logical_resource_id: logical_id.to_string(),
        };
        if let Some(s) = self.stacks.get_mut(stack) {
            s.events.insert(0, event);
        }
    }

    fn record(&mut self, operation: &'static str, stack: &str) -> Result<()> {
        self.calls.push(Call {
            operation,
            stack: stack.to_string(),
        });

        let key = (operation, stack.to_string());
        if let Some(left) = self.throttles.get_mut(&key)
            && *left > 0
        {
            *left -= 1;
            return Err(ControlPlaneError::throttled("Rate exceeded").into());
        }
        if let Some(message) = self.injected.get(&key) {
            return Err(ControlPlaneError::api("InjectedFailure", message.clone()).into());
        }
        Ok(())
    }

    /// Applies a create or update to a stack, emitting events.
    fn apply(
        &mut self,
        stack: &str,
        creating: bool,
        template: String,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
        termination_protection: Option<bool>,
    ) {
        self.start_operation();

        let verb = if creating { "CREATE" } else { "UPDATE" };
        let entry = self
            .stacks
            .entry(stack.to_string())
            .or_insert_with(|| FakeStack {
                description: StackDescription {
                    name: stack.to_string(),
                    stack_id: format!("arn:fake:stack/{stack}"),
                    status: RemoteStackStatus::from("REVIEW_IN_PROGRESS"),
                    status_reason: None,
                    outputs: Vec::new(),
                    tags: BTreeMap::new(),
                    parameters: BTreeMap::new(),
                    termination_protection: false,
                },
                template: String::new(),
                events: Vec::new(),
                polls_left: 0,
                settles_to: None,
            });
        entry.description.status = RemoteStackStatus::new(format!("{verb}_IN_PROGRESS"));
        if let Some(tp) = termination_protection {
            entry.description.termination_protection = tp;
        }

        self.push_event(stack, STACK_RESOURCE_TYPE, stack, &format!("{verb}_IN_PROGRESS"), None);

        let failure = self.deploy_failures.get(stack).cloned();
        let settles_to = if let Some(reason) = failure {
            self.push_event(stack, "AWS::S3::Bucket", "Bucket", &format!("{verb}_FAILED"), Some(&reason));
            self.push_event(
                stack,
                "AWS::S3::Bucket",
                "Other",
                &format!("{verb}_FAILED"),
                Some("Resource creation cancelled"),
            );
            if creating {
                self.push_event(stack, STACK_RESOURCE_TYPE, stack, "ROLLBACK_IN_PROGRESS", Some("The following resource(s) failed to create: [Bucket]."));
                self.push_event(stack, STACK_RESOURCE_TYPE, stack, "ROLLBACK_COMPLETE", None);
                RemoteStackStatus::from("ROLLBACK_COMPLETE")
            } else {
                self.push_event(stack, STACK_RESOURCE_TYPE, stack, "UPDATE_ROLLBACK_IN_PROGRESS", Some("The following resource(s) failed to update: [Bucket]."));
                self.push_event(stack, STACK_RESOURCE_TYPE, stack, "UPDATE_ROLLBACK_COMPLETE", None);
                RemoteStackStatus::from("UPDATE_ROLLBACK_COMPLETE")
            }
        } else {
            self.push_event(stack, "AWS::S3::Bucket", "Bucket", &format!("{verb}_COMPLETE"), None);
            self.push_event(stack, STACK_RESOURCE_TYPE, stack, &format!("{verb}_COMPLETE"), None);
            RemoteStackStatus::new(format!("{verb}_COMPLETE"))
        };

        let outputs = self.outputs.get(stack).cloned();
        let polls = self.settle_polls;
        if let Some(s) = self.stacks.get_mut(stack) {
            s.template = template;
            s.description.tags = tags;
            s.description.parameters = parameters;
            if !settles_to.is_rollback()
                && let Some(outputs) = outputs
            {
                s.description.outputs = outputs;
            }
            if polls == 0 {
                s.description.status = settles_to;
            } else {
                s.polls_left = polls;
                s.settles_to = Some(settles_to);
            }
        }
    }

    fn remove(&mut self, stack: &str) {
        self.start_operation();
        self.push_event(stack, STACK_RESOURCE_TYPE, stack, "DELETE_IN_PROGRESS", None);

        if let Some(reason) = self.delete_failures.get(stack).cloned() {
            self.push_event(stack, "AWS::S3::Bucket", "Bucket", "DELETE_FAILED", Some(&reason));
            self.push_event(stack, STACK_RESOURCE_TYPE, stack, "DELETE_FAILED", None);
            if let Some(s) = self.stacks.get_mut(stack) {
                s.description.status = RemoteStackStatus::from("DELETE_FAILED");
            }
            return;
        }

        self.push_event(stack, STACK_RESOURCE_TYPE, stack, "DELETE_COMPLETE", None);
        let polls = self.settle_polls;
        if polls == 0 {
            self.stacks.remove(stack);
        } else if let Some(s) = self.stacks.get_mut(stack) {
            s.description.status = RemoteStackStatus::from("DELETE_IN_PROGRESS");
            s.polls_left = polls;
            s.settles_to = Some(RemoteStackStatus::from("DELETE_COMPLETE"));
        }
    }
}

impl FakeControlPlane {
    /// Creates an empty control plane.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake control plane lock poisoned")
    }

    /// Seeds an existing stack.
    pub fn seed_stack(&self, name: &str, status: &str, template: &str) {
        let mut inner = self.lock();
        inner.stacks.insert(
            name.to_string(),
            FakeStack {
                description: StackDescription {
                    name: name.to_string(),
                    stack_id: format!("arn:fake:stack/{name}"),
                    status: RemoteStackStatus::from(status),
                    status_reason: None,
                    outputs: Vec::new(),
                    tags: BTreeMap::new(),
                    parameters: BTreeMap::new(),
                    termination_protection: false,
                },
                template: template.to_string(),
                events: Vec::new(),
                polls_left: 0,
                settles_to: None,
            },
        );
    }

    /// Seeds tags and parameters on an existing stack.
    pub fn seed_metadata(
        &self,
        name: &str,
        tags: BTreeMap<String, String>,
        parameters: BTreeMap<String, String>,
    ) {
        let mut inner = self.lock();
        if let Some(s) = inner.stacks.get_mut(name) {
            s.description.tags = tags;
            s.description.parameters = parameters;
        }
    }

    /// Outputs reported once the stack deploys successfully.
    pub fn set_outputs(&self, name: &str, outputs: Vec<StackOutput>) {
        self.lock().outputs.insert(name.to_string(), outputs);
    }

    /// Makes the next deployment of `name` fail with `reason`.
    pub fn fail_deploy(&self, name: &str, reason: &str) {
        self.lock()
            .deploy_failures
            .insert(name.to_string(), reason.to_string());
    }

    /// Makes deletion of `name` fail with `reason`.
    pub fn fail_delete(&self, name: &str, reason: &str) {
        self.lock()
            .delete_failures
            .insert(name.to_string(), reason.to_string());
    }

    /// Throttles the next `times` calls of `operation` on `stack`.
    pub fn throttle(&self, operation: &'static str, stack: &str, times: u32) {
        self.lock()
            .throttles
            .insert((operation, stack.to_string()), times);
    }

    /// Makes every call of `operation` on `stack` fail with a terminal error.
    pub fn inject_error(&self, operation: &'static str, stack: &str, message: &str) {
        self.lock()
            .injected
            .insert((operation, stack.to_string()), message.to_string());
    }

    /// Keeps operations in progress for `polls` describes before they settle.
    pub fn settle_after(&self, polls: u32) {
        self.lock().settle_polls = polls;
    }

    /// Every recorded call, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Recorded calls that change remote state.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATING_OPERATIONS.contains(&c.operation))
            .collect()
    }

    /// Index of the first call of `operation` on `stack`.
    #[must_use]
    pub fn first_call(&self, operation: &str, stack: &str) -> Option<usize> {
        self.calls()
            .iter()
            .position(|c| c.operation == operation && c.stack == stack)
    }

    /// Current remote status of a stack, if it exists.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<String> {
        self.lock()
            .stacks
            .get(name)
            .map(|s| s.description.status.as_str().to_string())
    }
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlane {
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>> {
        let mut inner = self.lock();
        inner.record("describe_stack", stack_name)?;

        let Some(stack) = inner.stacks.get_mut(stack_name) else {
            return Ok(None);
        };

        if stack.polls_left > 0 {
            stack.polls_left -= 1;
            if stack.polls_left == 0
                && let Some(settled) = stack.settles_to.take()
            {
                if settled.is_deleted() {
                    inner.stacks.remove(stack_name);
                    return Ok(None);
                }
                stack.description.status = settled;
            }
        }

        Ok(inner
            .stacks
            .get(stack_name)
            .map(|s| s.description.clone()))
    }

    async fn get_template(&self, stack_name: &str) -> Result<String> {
        let mut inner = self.lock();
        inner.record("get_template", stack_name)?;
        inner
            .stacks
            .get(stack_name)
            .map(|s| s.template.clone())
            .ok_or_else(|| ControlPlaneError::stack_not_found(stack_name).into())
    }

    async fn describe_stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
        let mut inner = self.lock();
        inner.record("describe_stack_events", stack_name)?;
        inner
            .stacks
            .get(stack_name)
            .map(|s| s.events.clone())
            .ok_or_else(|| ControlPlaneError::stack_not_found(stack_name).into())
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String> {
        let mut inner = self.lock();
        inner.record("create_stack", &request.stack_name)?;
        if inner.stacks.contains_key(&request.stack_name) {
            return Err(ControlPlaneError::api(
                "AlreadyExistsException",
                format!("Stack [{}] already exists", request.stack_name),
            )
            .into());
        }
        inner.apply(
            &request.stack_name,
            true,
            body_of(&request.template),
            request.tags.clone(),
            request.parameters.clone(),
            Some(request.termination_protection),
        );
        Ok(format!("arn:fake:stack/{}", request.stack_name))
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<String> {
        let mut inner = self.lock();
        inner.record("update_stack", &request.stack_name)?;
        let body = body_of(&request.template);
        let Some(existing) = inner.stacks.get(&request.stack_name) else {
            return Err(ControlPlaneError::stack_not_found(&request.stack_name).into());
        };
        if existing.template == body
            && existing.description.tags == request.tags
            && existing.description.parameters == request.parameters
        {
            return Err(ControlPlaneError::NoUpdates {
                stack: request.stack_name.clone(),
            }
            .into());
        }
        inner.apply(
            &request.stack_name,
            false,
            body,
            request.tags.clone(),
            request.parameters.clone(),
            None,
        );
        Ok(format!("arn:fake:stack/{}", request.stack_name))
    }

    async fn delete_stack(&self, stack_name: &str, _role_arn: Option<&str>) -> Result<()> {
        let mut inner = self.lock();
        inner.record("delete_stack", stack_name)?;
        if inner.stacks.contains_key(stack_name) {
            inner.remove(stack_name);
        }
        Ok(())
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<String> {
        let mut inner = self.lock();
        let stack = &request.stack;
        inner.record("create_change_set", &stack.stack_name)?;

        let template = body_of(&stack.template);
        let change_count = match inner.stacks.get(&stack.stack_name) {
            Some(existing)
                if request.change_set_type != ChangeSetType::Create
                    && existing.template == template
                    && existing.description.tags == stack.tags
                    && existing.description.parameters == stack.parameters =>
            {
                0
            }
            _ => 1,
        };

        if request.change_set_type == ChangeSetType::Create
            && !inner.stacks.contains_key(&stack.stack_name)
        {
            inner.stacks.insert(
                stack.stack_name.clone(),
                FakeStack {
                    description: StackDescription {
                        name: stack.stack_name.clone(),
                        stack_id: format!("arn:fake:stack/{}", stack.stack_name),
                        status: RemoteStackStatus::from("REVIEW_IN_PROGRESS"),
                        status_reason: None,
                        outputs: Vec::new(),
                        tags: BTreeMap::new(),
                        parameters: BTreeMap::new(),
                        termination_protection: false,
                    },
                    template: String::new(),
                    events: Vec::new(),
                    polls_left: 0,
                    settles_to: None,
                },
            );
        }

        inner.change_sets.insert(
            (stack.stack_name.clone(), request.change_set_name.clone()),
            PendingChangeSet {
                change_set_type: request.change_set_type,
                template,
                tags: stack.tags.clone(),
                parameters: stack.parameters.clone(),
                change_count,
            },
        );

        Ok(format!(
            "arn:fake:changeSet/{}/{}",
            request.change_set_name, stack.stack_name
        ))
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<ChangeSetDescription> {
        let mut inner = self.lock();
        inner.record("describe_change_set", stack_name)?;
        let Some(cs) = inner
            .change_sets
            .get(&(stack_name.to_string(), change_set_name.to_string()))
        else {
            return Err(StackweaveError::ControlPlane(
                ControlPlaneError::ChangeSetNotFound {
                    stack: stack_name.to_string(),
                    change_set: change_set_name.to_string(),
                },
            ));
        };

        let (status, reason) = if cs.change_count == 0 {
            (
                ChangeSetStatus::Failed,
                Some(String::from(
                    "The submitted information didn't contain changes. Submit different information to create a change set.",
                )),
            )
        } else {
            (ChangeSetStatus::Complete, None)
        };

        Ok(ChangeSetDescription {
            change_set_id: format!("arn:fake:changeSet/{change_set_name}/{stack_name}"),
            status,
            status_reason: reason,
            change_count: cs.change_count,
        })
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        _client_token: &str,
        _rollback: bool,
    ) -> Result<()> {
        let mut inner = self.lock();
        inner.record("execute_change_set", stack_name)?;
        let Some(cs) = inner
            .change_sets
            .remove(&(stack_name.to_string(), change_set_name.to_string()))
        else {
            return Err(StackweaveError::ControlPlane(
                ControlPlaneError::ChangeSetNotFound {
                    stack: stack_name.to_string(),
                    change_set: change_set_name.to_string(),
                },
            ));
        };
        inner.apply(
            stack_name,
            cs.change_set_type == ChangeSetType::Create,
            cs.template,
            cs.tags,
            cs.parameters,
            None,
        );
        Ok(())
    }

    async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()> {
        let mut inner = self.lock();
        inner.record("delete_change_set", stack_name)?;
        inner
            .change_sets
            .remove(&(stack_name.to_string(), change_set_name.to_string()));
        Ok(())
    }

    async fn update_termination_protection(&self, stack_name: &str, enabled: bool) -> Result<()> {
        let mut inner = self.lock();
        inner.record("update_termination_protection", stack_name)?;
        if let Some(s) = inner.stacks.get_mut(stack_name) {
            s.description.termination_protection = enabled;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "fake"
    }
}
