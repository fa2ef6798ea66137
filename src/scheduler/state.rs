//! Explicit per-run stack state.
//!
//! One [`StackState`] exists per stack per run. Status transitions are
//! validated, readiness is computed from a snapshot of statuses, and the
//! failure sweep is scoped by [`FailureScope`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::deploy::{EventLog, StackOutputs, StackSpec};
use crate::error::{Result, ScheduleError, StackweaveError};

use super::graph::StackGraph;
use super::progress::{ProgressEvent, ProgressSink};

/// Operation a run performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create or update stacks.
    Deploy,
    /// Delete stacks.
    Destroy,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deploy => write!(f, "deploy"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// Status of a stack within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackStatus {
    /// Waiting for dependencies.
    Pending,
    /// Deployment in flight.
    Deploying,
    /// Deletion in flight.
    Removing,
    /// Operation finished successfully.
    Succeeded,
    /// Nothing had to change.
    Unchanged,
    /// Operation failed.
    Failed,
    /// Never started.
    Skipped,
}

impl StackStatus {
    /// The status will not change again in this run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Unchanged | Self::Failed | Self::Skipped
        )
    }

    /// An operation is in flight.
    #[must_use]
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Deploying | Self::Removing)
    }

    /// Whether this dependency status lets a dependent start.
    #[must_use]
    pub const fn satisfies(self, operation: Operation) -> bool {
        match operation {
            Operation::Deploy => matches!(self, Self::Succeeded | Self::Unchanged),
            Operation::Destroy => matches!(self, Self::Succeeded),
        }
    }

    /// Whether moving to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Deploying | Self::Removing | Self::Skipped)
                | (
                    Self::Deploying | Self::Removing,
                    Self::Succeeded | Self::Unchanged | Self::Failed
                )
        )
    }

    /// Word used when reporting the status.
    #[must_use]
    pub const fn label(self, operation: Operation) -> &'static str {
        match (operation, self) {
            (_, Self::Pending) => "pending",
            (_, Self::Deploying) => "deploying",
            (_, Self::Removing) => "removing",
            (_, Self::Failed) => "failed",
            (_, Self::Unchanged) => "no changes",
            (Operation::Deploy, Self::Succeeded) => "deployed",
            (Operation::Deploy, Self::Skipped) => "not deployed",
            (Operation::Destroy, Self::Succeeded) => "removed",
            (Operation::Destroy, Self::Skipped) => "not removed",
        }
    }
}

impl fmt::Display for StackStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Deploying => "deploying",
            Self::Removing => "removing",
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Which pending stacks a failure skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureScope {
    /// Only stacks that transitively depend on the failed one.
    #[default]
    Dependents,
    /// Every stack still pending.
    AllPending,
}

/// State of one stack within a run.
#[derive(Debug, Clone, Serialize)]
pub struct StackState {
    /// Stack name.
    pub name: String,
    /// Operation being run.
    pub operation: Operation,
    status: StackStatus,
    /// Stacks that must settle first: dependencies for deploy, dependents
    /// for destroy.
    pub dependencies: BTreeSet<String>,
    /// When the operation was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the stack reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
    /// Outputs, set on success only.
    pub outputs: BTreeMap<String, String>,
    /// Exports, set on success only.
    pub exports: BTreeMap<String, String>,
    /// Events observed during the run.
    pub events: EventLog,
    /// Error message for failed or skipped stacks.
    pub error_message: Option<String>,
}

impl StackState {
    /// Creates a pending state.
    #[must_use]
    pub fn new(name: impl Into<String>, operation: Operation, dependencies: BTreeSet<String>) -> Self {
        Self {
            name: name.into(),
            operation,
            status: StackStatus::Pending,
            dependencies,
            started_at: None,
            ended_at: None,
            outputs: BTreeMap::new(),
            exports: BTreeMap::new(),
            events: EventLog::new(),
            error_message: None,
        }
    }

    /// Current status.
    #[must_use]
    pub const fn status(&self) -> StackStatus {
        self.status
    }

    /// Moves to `next`, stamping start and end times.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::InvalidTransition`] for any transition the
    /// state machine does not allow.
    pub fn transition(&mut self, next: StackStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ScheduleError::InvalidTransition {
                stack: self.name.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            }
            .into());
        }

        debug!("{}: {} -> {next}", self.name, self.status);
        if next.is_in_flight() {
            self.started_at = Some(Utc::now());
        }
        if next.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        self.status = next;
        Ok(())
    }

    /// Marks the operation started.
    ///
    /// # Errors
    ///
    /// Returns an error unless the stack is pending.
    pub fn start(&mut self) -> Result<()> {
        let next = match self.operation {
            Operation::Deploy => StackStatus::Deploying,
            Operation::Destroy => StackStatus::Removing,
        };
        self.transition(next)
    }

    /// Marks the stack succeeded with its outputs.
    ///
    /// # Errors
    ///
    /// Returns an error unless an operation is in flight.
    pub fn succeed(&mut self, outputs: StackOutputs) -> Result<()> {
        self.transition(StackStatus::Succeeded)?;
        self.outputs = outputs.outputs;
        self.exports = outputs.exports;
        Ok(())
    }

    /// Marks the stack unchanged with its current outputs.
    ///
    /// # Errors
    ///
    /// Returns an error unless an operation is in flight.
    pub fn unchanged(&mut self, outputs: StackOutputs) -> Result<()> {
        self.transition(StackStatus::Unchanged)?;
        self.outputs = outputs.outputs;
        self.exports = outputs.exports;
        Ok(())
    }

    /// Marks the stack failed.
    ///
    /// # Errors
    ///
    /// Returns an error unless an operation is in flight.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(StackStatus::Failed)?;
        self.error_message = Some(message.into());
        Ok(())
    }

    /// Marks a pending stack skipped.
    ///
    /// # Errors
    ///
    /// Returns an error unless the stack is pending.
    pub fn skip(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(StackStatus::Skipped)?;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Fails the stack with `error` and reports it.
    ///
    /// # Errors
    ///
    /// Returns an error unless an operation is in flight.
    pub fn fail_with(&mut self, error: &StackweaveError, sink: &ProgressSink) -> Result<()> {
        error!("{}: {error}", self.name);
        self.fail(error.detail())?;
        sink.finished(self);
        Ok(())
    }

    /// Handles an error raised while refreshing an in-flight stack.
    ///
    /// Transient errors, including exhausted retries, leave the stack for the
    /// next pass. Returns whether the stack failed.
    ///
    /// # Errors
    ///
    /// Returns an error unless an operation is in flight.
    pub fn fail_unless_transient(
        &mut self,
        error: &StackweaveError,
        sink: &ProgressSink,
    ) -> Result<bool> {
        if error.is_transient() {
            warn!("{}: {error}, checking again on the next pass", self.name);
            return Ok(false);
        }
        self.fail_with(error, sink)?;
        Ok(true)
    }

    /// Time between dispatch and settlement.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.started_at?)
    }
}

/// Statuses of every stack at one instant.
pub type StatusSnapshot = BTreeMap<String, StackStatus>;

/// All stack states of a run, keyed by name.
#[derive(Debug, Clone)]
pub struct StackStateStore {
    operation: Operation,
    states: BTreeMap<String, StackState>,
}

impl StackStateStore {
    /// Materializes pending states for a deploy run.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate names, unknown dependencies or cycles.
    pub fn for_deploy(specs: &[StackSpec]) -> Result<Self> {
        let graph = StackGraph::build(specs.iter().map(|s| (s.name.as_str(), &s.dependencies)))?;
        Ok(Self::from_graph(Operation::Deploy, &graph))
    }

    /// Materializes pending states for a destroy run over the reverse graph.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate names, unknown dependencies or cycles.
    pub fn for_destroy(specs: &[StackSpec]) -> Result<Self> {
        let graph = StackGraph::build(specs.iter().map(|s| (s.name.as_str(), &s.dependencies)))?;
        Ok(Self::from_graph(Operation::Destroy, &graph.reversed()))
    }

    fn from_graph(operation: Operation, graph: &StackGraph) -> Self {
        let states = graph
            .names()
            .map(|name| {
                let deps = graph.dependencies(name).cloned().unwrap_or_default();
                (name.to_string(), StackState::new(name, operation, deps))
            })
            .collect();
        Self { operation, states }
    }

    /// Operation of the run.
    #[must_use]
    pub const fn operation(&self) -> Operation {
        self.operation
    }

    /// State of one stack.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StackState> {
        self.states.get(name)
    }

    /// Mutable state of one stack.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut StackState> {
        self.states.get_mut(name)
    }

    /// States in name order.
    pub fn iter(&self) -> impl Iterator<Item = &StackState> {
        self.states.values()
    }

    /// Mutable states in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut StackState> {
        self.states.values_mut()
    }

    /// Number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the run has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Current status of every stack.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.states
            .iter()
            .map(|(name, state)| (name.clone(), state.status))
            .collect()
    }

    /// Pending stacks whose dependencies all satisfy the operation in
    /// `snapshot`.
    #[must_use]
    pub fn ready(&self, snapshot: &StatusSnapshot) -> Vec<String> {
        self.states
            .values()
            .filter(|state| snapshot.get(&state.name) == Some(&StackStatus::Pending))
            .filter(|state| {
                state.dependencies.iter().all(|dep| {
                    snapshot
                        .get(dep)
                        .is_some_and(|s| s.satisfies(self.operation))
                })
            })
            .map(|state| state.name.clone())
            .collect()
    }

    /// Names of stacks with an operation in flight.
    #[must_use]
    pub fn in_flight(&self) -> Vec<String> {
        self.states
            .values()
            .filter(|s| s.status.is_in_flight())
            .map(|s| s.name.clone())
            .collect()
    }

    /// Skips the pending stacks affected by the failure of `failed`.
    ///
    /// Returns the names of the stacks that were skipped.
    pub fn skip_pending_stacks(
        &mut self,
        failed: &str,
        scope: FailureScope,
        sink: &ProgressSink,
    ) -> Vec<String> {
        let targets: BTreeSet<String> = match scope {
            FailureScope::AllPending => self.states.keys().cloned().collect(),
            FailureScope::Dependents => self.dependents_of(failed),
        };

        let verb = match self.operation {
            Operation::Deploy => "deploy",
            Operation::Destroy => "destroy",
        };
        self.skip_pending(&targets, &format!("{failed} failed to {verb}"), sink)
    }

    /// Skips every pending stack.
    pub fn skip_all_pending(&mut self, reason: &str, sink: &ProgressSink) -> Vec<String> {
        let all: BTreeSet<String> = self.states.keys().cloned().collect();
        self.skip_pending(&all, reason, sink)
    }

    fn skip_pending(
        &mut self,
        targets: &BTreeSet<String>,
        reason: &str,
        sink: &ProgressSink,
    ) -> Vec<String> {
        let mut skipped = Vec::new();
        for state in self.states.values_mut() {
            if state.status != StackStatus::Pending || !targets.contains(&state.name) {
                continue;
            }
            if state.skip(reason).is_ok() {
                info!("{}: skipped ({reason})", state.name);
                sink.emit(ProgressEvent::StackSkipped {
                    stack: state.name.clone(),
                    operation: self.operation,
                    reason: reason.to_string(),
                });
                skipped.push(state.name.clone());
            }
        }
        skipped
    }

    /// Stacks that wait on `name`, transitively.
    fn dependents_of(&self, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([name.to_string()]);
        while let Some(current) = queue.pop_front() {
            for state in self.states.values() {
                if state.dependencies.contains(&current) && found.insert(state.name.clone()) {
                    queue.push_back(state.name.clone());
                }
            }
        }
        found
    }

    /// No stack is pending or in flight.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.states.values().all(|s| s.status.is_terminal())
    }

    /// Consumes the store into a run report.
    #[must_use]
    pub fn into_report(self, passes: usize) -> RunReport {
        let is_completed = self.is_completed();
        RunReport {
            operation: self.operation,
            stacks: self.states.into_values().collect(),
            is_completed,
            passes,
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Operation of the run.
    pub operation: Operation,
    /// Final state of every stack, in name order.
    pub stacks: Vec<StackState>,
    /// No stack is left pending or in flight.
    pub is_completed: bool,
    /// Passes executed.
    pub passes: usize,
}

impl RunReport {
    /// State of one stack.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StackState> {
        self.stacks.iter().find(|s| s.name == name)
    }

    /// Status of one stack.
    #[must_use]
    pub fn status_of(&self, name: &str) -> Option<StackStatus> {
        self.get(name).map(StackState::status)
    }

    /// Whether any stack failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.stacks.iter().any(|s| s.status == StackStatus::Failed)
    }

    /// Number of stacks with the given status.
    #[must_use]
    pub fn count(&self, status: StackStatus) -> usize {
        self.stacks.iter().filter(|s| s.status == status).count()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} run {} after {} pass(es):",
            self.operation,
            if self.is_completed { "completed" } else { "incomplete" },
            self.passes
        )?;
        for stack in &self.stacks {
            write!(f, "  {}: {}", stack.name, stack.status.label(self.operation))?;
            if let Some(message) = &stack.error_message {
                write!(f, " ({message})")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
