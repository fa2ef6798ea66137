//! Control-plane client trait.
//!
//! Every remote primitive the deployer and schedulers need goes through this
//! trait. Implementations classify provider errors into
//! [`ControlPlaneError`](crate::error::ControlPlaneError) before returning.

use async_trait::async_trait;

use crate::error::Result;

use super::types::{
    ChangeSetDescription, ChangeSetRequest, StackDescription, StackEvent, StackRequest,
};

/// Remote control plane for stacks.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Describes a stack, returning `None` when it does not exist.
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>>;

    /// Fetches the deployed template body of a stack.
    async fn get_template(&self, stack_name: &str) -> Result<String>;

    /// Lists stack events, newest first.
    ///
    /// Returns [`ControlPlaneError::StackNotFound`](crate::error::ControlPlaneError::StackNotFound)
    /// when the stack does not exist.
    async fn describe_stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>>;

    /// Creates a stack and returns its identifier.
    async fn create_stack(&self, request: &StackRequest) -> Result<String>;

    /// Updates a stack and returns its identifier.
    ///
    /// Returns [`ControlPlaneError::NoUpdates`](crate::error::ControlPlaneError::NoUpdates)
    /// when nothing would change.
    async fn update_stack(&self, request: &StackRequest) -> Result<String>;

    /// Starts deleting a stack.
    async fn delete_stack(&self, stack_name: &str, role_arn: Option<&str>) -> Result<()>;

    /// Creates a change set and returns its identifier.
    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<String>;

    /// Describes a change set.
    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<ChangeSetDescription>;

    /// Executes a computed change set.
    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_token: &str,
        rollback: bool,
    ) -> Result<()>;

    /// Deletes a change set. Deleting a missing change set is not an error.
    async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()>;

    /// Enables or disables termination protection.
    async fn update_termination_protection(&self, stack_name: &str, enabled: bool) -> Result<()>;

    /// Returns a human-readable backend name.
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<T: ControlPlaneClient + ?Sized> ControlPlaneClient for std::sync::Arc<T> {
    async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackDescription>> {
        (**self).describe_stack(stack_name).await
    }

    async fn get_template(&self, stack_name: &str) -> Result<String> {
        (**self).get_template(stack_name).await
    }

    async fn describe_stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
        (**self).describe_stack_events(stack_name).await
    }

    async fn create_stack(&self, request: &StackRequest) -> Result<String> {
        (**self).create_stack(request).await
    }

    async fn update_stack(&self, request: &StackRequest) -> Result<String> {
        (**self).update_stack(request).await
    }

    async fn delete_stack(&self, stack_name: &str, role_arn: Option<&str>) -> Result<()> {
        (**self).delete_stack(stack_name, role_arn).await
    }

    async fn create_change_set(&self, request: &ChangeSetRequest) -> Result<String> {
        (**self).create_change_set(request).await
    }

    async fn describe_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
    ) -> Result<ChangeSetDescription> {
        (**self)
            .describe_change_set(stack_name, change_set_name)
            .await
    }

    async fn execute_change_set(
        &self,
        stack_name: &str,
        change_set_name: &str,
        client_token: &str,
        rollback: bool,
    ) -> Result<()> {
        (**self)
            .execute_change_set(stack_name, change_set_name, client_token, rollback)
            .await
    }

    async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()> {
        (**self).delete_change_set(stack_name, change_set_name).await
    }

    async fn update_termination_protection(&self, stack_name: &str, enabled: bool) -> Result<()> {
        (**self)
            .update_termination_protection(stack_name, enabled)
            .await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}
