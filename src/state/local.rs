//! Local file-based run-record storage.
//!
//! The record and the lock live in a directory next to the manifest,
//! `.stackweave/` unless the manifest names another one.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, StackweaveError, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::{DeploymentState, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".stackweave";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
}

impl LocalStateStore {
    /// Creates a store for one stage under `base_dir`.
    ///
    /// Each stage gets its own record file, `{stage}.json`.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>, stage: &str) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(format!("{stage}.json"));
        let lock_path = base_dir.join(format!("{stage}.{LOCK_FILE}"));

        Self {
            base_dir,
            state_path,
            lock_path,
        }
    }

    /// Creates the store for a manifest located in `manifest_dir`.
    #[must_use]
    pub fn for_manifest(manifest_dir: &Path, dir: Option<&str>, stage: &str) -> Self {
        Self::new(manifest_dir.join(dir.unwrap_or(STATE_DIR)), stage)
    }

    /// Path of the record file.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read lock file: {e}"),
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse lock file: {e}"),
        })?;

        Ok(Some(lock_info))
    }

    /// Writes `content` to `path` through a temporary file and a rename.
    async fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        self.ensure_dir().await?;
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            StateError::storage(format!("Failed to create {}: {e}", temp_path.display()))
        })?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write {}: {e}", temp_path.display())))?;
        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync {}: {e}", temp_path.display())))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename {}: {e}", temp_path.display())))?;
        Ok(())
    }

    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<Option<DeploymentState>> {
        if !self.state_path.exists() {
            debug!("State file does not exist: {}", self.state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", self.state_path.display());

        let content = fs::read_to_string(&self.state_path).await.map_err(|e| StateError::Corrupted {
            message: format!("Failed to read state file: {e}"),
        })?;

        let state: DeploymentState = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse state file: {e}"),
        })?;

        if state.version != STATE_VERSION {
            return Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: state.version,
            }
            .into());
        }

        Ok(Some(state))
    }

    async fn save(&self, state: &DeploymentState) -> Result<()> {
        info!("Saving state to: {}", self.state_path.display());

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        self.write_atomic(&self.state_path, &content).await?;

        debug!("State saved successfully");
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StackweaveError::State(StateError::LockedByOther {
                    holder: existing.holder,
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            warn!("Taking over expired lock held by {}", existing.holder);
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(holder_id);
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        self.write_atomic(&self.lock_path, &content).await?;

        debug!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.is_held_by(lock_id) {
                self.delete_lock_file().await?;
                debug!("Released state lock: {lock_id}");
            } else {
                warn!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock_file().await?;
        if let Some(lock) = &existing {
            info!("Removing lock held by {} since {}", lock.holder, lock.acquired_at);
            self.delete_lock_file().await?;
        }
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::for_manifest(temp_dir.path(), None, "dev");
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, temp) = create_test_store();

        let state = DeploymentState::new("shop", "dev");
        store.save(&state).await.expect("Failed to save state");

        let loaded = store
            .load()
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.project, "shop");
        assert_eq!(loaded.stage, "dev");
        assert_eq!(store.state_path(), temp.path().join(".stackweave").join("dev.json"));
        assert!(!store.state_path().with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let (store, _temp) = create_test_store();
        let mut state = DeploymentState::new("shop", "dev");
        state.version = String::from("0.1");
        store.save(&state).await.expect("Failed to save state");

        let err = store.load().await.expect_err("old version");
        assert!(matches!(
            err,
            StackweaveError::State(StateError::VersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_stages_are_isolated() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let dev = LocalStateStore::for_manifest(temp.path(), Some("state"), "dev");
        let prod = LocalStateStore::for_manifest(temp.path(), Some("state"), "prod");

        dev.save(&DeploymentState::new("shop", "dev")).await.expect("save");
        let _lock = dev.acquire_lock("dev-run").await.expect("lock dev");

        assert!(prod.load().await.expect("load").is_none());
        assert!(prod.acquire_lock("prod-run").await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder")
            .await
            .expect("Failed to acquire lock");
        assert_eq!(
            store.get_lock_info().await.expect("lock info"),
            Some(lock.clone())
        );

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(store.get_lock_info().await.expect("lock info").is_none());
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2").await;
        assert!(matches!(
            result,
            Err(StackweaveError::State(StateError::LockedByOther { ref holder, .. })) if holder == "holder-1"
        ));
    }

    #[tokio::test]
    async fn test_force_unlock() {
        let (store, _temp) = create_test_store();
        store.acquire_lock("stuck-run").await.expect("lock");

        let removed = store.force_unlock().await.expect("unlock");
        assert_eq!(removed.map(|l| l.holder).as_deref(), Some("stuck-run"));
        assert!(store.acquire_lock("next-run").await.is_ok());
    }
}
