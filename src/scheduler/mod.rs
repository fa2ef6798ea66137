//! Graph scheduling.
//!
//! This module runs the deploy and destroy loops over the stack graph:
//! - Graph validation and ordering
//! - Explicit per-stack state with validated transitions
//! - Fixed-point dispatch across multiple passes
//! - The progress stream consumed by renderers

mod control;
mod deploy;
mod destroy;
mod graph;
mod progress;
mod state;

pub use control::{CancellationSignal, DEFAULT_PASS_INTERVAL_SECS, SchedulerOptions};
pub use deploy::DeployScheduler;
pub use destroy::DestroyScheduler;
pub use graph::{StackGraph, select_stacks};
pub use progress::{ProgressEvent, ProgressSink};
pub use state::{
    FailureScope, Operation, RunReport, StackState, StackStateStore, StackStatus, StatusSnapshot,
};
