//! Run record types.
//!
//! The run record is what a previous run left behind: per-stack status,
//! outputs and template hashes, plus a bounded history of runs. `status` and
//! `diff` read it; deploy and remove update it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::scheduler::{Operation, RunReport, StackState, StackStatus};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Maximum number of history entries kept.
pub const MAX_HISTORY: usize = 100;

/// The complete run record of a project stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Stage name.
    pub stage: String,
    /// Hash of the last applied manifest.
    pub config_hash: String,
    /// Records of deployed stacks, by full stack name.
    pub stacks: BTreeMap<String, StackRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// What the last run recorded for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackRecord {
    /// Full stack name.
    pub name: String,
    /// Status of the stack at the end of the run.
    pub status: StackStatus,
    /// Hash of the template last deployed.
    pub template_hash: String,
    /// Output values by key.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Exported values by export name.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Failure message of the run, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Operation of the run.
    pub operation: Operation,
    /// Manifest hash at the time of the run.
    pub config_hash: String,
    /// Stacks the run touched, with their reporting label.
    pub stacks: BTreeMap<String, String>,
    /// Whether every stack reached its desired state.
    pub success: bool,
}

impl DeploymentState {
    /// Creates a new empty run record.
    #[must_use]
    pub fn new(project: &str, stage: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            stage: stage.to_string(),
            config_hash: String::new(),
            stacks: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a stack record by full name.
    #[must_use]
    pub fn get_stack(&self, name: &str) -> Option<&StackRecord> {
        self.stacks.get(name)
    }

    /// Folds a run report into the record.
    ///
    /// Deployed and unchanged stacks are recorded with the template hash
    /// they were deployed from, removed stacks are dropped and failed
    /// stacks keep their previous hash so `diff` still reports them.
    pub fn apply_report(
        &mut self,
        report: &RunReport,
        template_hashes: &BTreeMap<String, String>,
        config_hash: &str,
    ) {
        let now = Utc::now();

        for stack in &report.stacks {
            match (report.operation, stack.status()) {
                (Operation::Deploy, StackStatus::Succeeded | StackStatus::Unchanged) => {
                    let record = StackRecord::from_state(
                        stack,
                        template_hashes.get(&stack.name).cloned().unwrap_or_default(),
                        now,
                    );
                    self.stacks.insert(stack.name.clone(), record);
                }
                (Operation::Destroy, StackStatus::Succeeded) => {
                    self.stacks.remove(&stack.name);
                }
                (_, StackStatus::Failed) => {
                    let previous_hash = self
                        .stacks
                        .get(&stack.name)
                        .map(|r| r.template_hash.clone())
                        .unwrap_or_default();
                    let mut record = StackRecord::from_state(stack, previous_hash, now);
                    if let Some(previous) = self.stacks.get(&stack.name) {
                        record.outputs.clone_from(&previous.outputs);
                        record.exports.clone_from(&previous.exports);
                    }
                    self.stacks.insert(stack.name.clone(), record);
                }
                _ => {}
            }
        }

        if report.operation == Operation::Deploy && !report.has_failures() {
            self.config_hash = config_hash.to_string();
        }

        self.add_history(RunHistoryEntry {
            timestamp: now,
            operation: report.operation,
            config_hash: config_hash.to_string(),
            stacks: report
                .stacks
                .iter()
                .map(|s| (s.name.clone(), s.status().label(report.operation).to_string()))
                .collect(),
            success: report.is_completed && !report.has_failures(),
        });
        self.last_updated = now;
    }

    /// Adds a history entry, dropping the oldest past [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Most recent run, if any.
    #[must_use]
    pub fn last_run(&self) -> Option<&RunHistoryEntry> {
        self.history.last()
    }

    /// Returns all recorded stack names.
    #[must_use]
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.keys().map(String::as_str).collect()
    }
}

impl StackRecord {
    fn from_state(state: &StackState, template_hash: String, now: DateTime<Utc>) -> Self {
        Self {
            name: state.name.clone(),
            status: state.status(),
            template_hash,
            outputs: state.outputs.clone(),
            exports: state.exports.clone(),
            error: state.error_message.clone(),
            updated_at: now,
        }
    }
}
