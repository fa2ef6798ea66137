//! Run-record store trait.

use async_trait::async_trait;

use crate::error::Result;
use super::types::DeploymentState;
use super::lock::LockInfo;

/// Storage backend for the run record.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the run record.
    ///
    /// Returns `None` if no run has been recorded yet.
    async fn load(&self) -> Result<Option<DeploymentState>>;

    /// Saves the run record.
    async fn save(&self, state: &DeploymentState) -> Result<()>;

    /// Acquires the run lock.
    ///
    /// Fails while another unexpired lock is held.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the run lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the run lock regardless of its holder.
    async fn force_unlock(&self) -> Result<Option<LockInfo>>;

    /// Current lock, expired or not.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
