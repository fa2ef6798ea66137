//! Run-record persistence.
//!
//! This module records what each run left behind so later runs and the
//! `status` and `diff` commands can compare against it:
//! - Per-stack status, outputs and template hashes
//! - A bounded run history
//! - A run lock so two runs never overlap on one stage

mod store;
mod local;
mod lock;
mod types;

pub use store::StateStore;
pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use types::{DeploymentState, MAX_HISTORY, RunHistoryEntry, STATE_VERSION, StackRecord};
