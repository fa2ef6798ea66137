//! Per-stack deployment.
//!
//! This module drives a single stack to its desired state:
//! - Skip-deploy analysis against the deployed stack
//! - Hotswap short-circuits for development deploys
//! - Change-set and direct deployment protocols
//! - Incremental event monitoring with first-failure capture

mod spec;
mod skip;
mod hotswap;
mod monitor;
mod deployer;

pub use spec::{
    DEFAULT_CHANGE_SET_NAME, DeployOptions, DeploymentMethod, HotswapMode, StackSpec,
    StackTemplate,
};
pub use skip::{CurrentStack, DeployDecision, DeployReason, SkipDeployAnalyzer};
pub use hotswap::{HotswapChange, HotswapOutcome, Hotswapper, ResourcePatcher};
pub use monitor::{EventLog, StackEventMonitor, WATERMARK_LEAD_SECS};
pub use deployer::{
    ChangeSetDeployer, DEFAULT_POLL_INTERVAL_MS, DEFAULT_WAIT_TIMEOUT_SECS, DestroyOutcome, DeployOutcome, MonitorMode, StackOutputs, settle_deploy,
    settle_destroy,
};
