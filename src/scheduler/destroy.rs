//! Reverse-dependency-ordered removal of a stack graph.
//!
//! A stack is removed only once every stack depending on it is gone.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

use crate::deploy::{ChangeSetDeployer, DestroyOutcome, StackOutputs, StackSpec, settle_destroy};
use crate::error::{Result, ScheduleError};

use super::control::{CancellationSignal, SchedulerOptions};
use super::progress::ProgressEvent;
use super::state::{Operation, RunReport, StackState, StackStateStore, StackStatus};

/// Removes a set of stacks in reverse dependency order.
pub struct DestroyScheduler {
    deployer: ChangeSetDeployer,
    options: SchedulerOptions,
    cancel: CancellationSignal,
}

impl DestroyScheduler {
    /// Creates a scheduler around a deployer.
    #[must_use]
    pub fn new(deployer: ChangeSetDeployer) -> Self {
        Self {
            deployer,
            options: SchedulerOptions::default(),
            cancel: CancellationSignal::never(),
        }
    }

    /// Sets the run options.
    #[must_use]
    pub const fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Removes every stack in `specs`.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid dependency graph or a broken state
    /// machine invariant.
    pub async fn run(&self, specs: &[StackSpec]) -> Result<RunReport> {
        let mut store = StackStateStore::for_destroy(specs)?;
        let roles: BTreeMap<&str, Option<&str>> = specs
            .iter()
            .map(|s| (s.name.as_str(), s.options.role_arn.as_deref()))
            .collect();
        let sink = self.deployer.progress();

        info!("Removing {} stack(s)", store.len());

        let mut pass = 0;
        loop {
            pass += 1;
            let new_events = self.refresh(&mut store).await?;
            self.dispatch(&mut store, &roles).await?;

            if store.is_completed() {
                break;
            }

            if self.options.max_passes.is_some_and(|max| pass >= max) {
                warn!(
                    "Stopping after {pass} pass(es) with {} stack(s) still being removed",
                    store.in_flight().len()
                );
                break;
            }

            if new_events == 0 {
                debug!("Checking remove status...");
            }
            sink.emit(ProgressEvent::Waiting { pass, new_events });
            tokio::time::sleep(self.options.poll_interval).await;
        }

        let report = store.into_report(pass);
        info!(
            "Remove finished: {} removed, {} failed, {} skipped",
            report.count(StackStatus::Succeeded),
            report.count(StackStatus::Failed),
            report.count(StackStatus::Skipped)
        );
        Ok(report)
    }

    async fn refresh(&self, store: &mut StackStateStore) -> Result<usize> {
        let deployer = &self.deployer;
        let results = join_all(
            store
                .iter_mut()
                .filter(|s| s.status() == StackStatus::Removing)
                .map(|state| refresh_stack(deployer, state)),
        )
        .await;

        let mut new_events = 0;
        let mut failed = Vec::new();
        for result in results {
            let (events, failure) = result?;
            new_events += events;
            failed.extend(failure);
        }

        for name in &failed {
            store.skip_pending_stacks(name, self.options.failure_scope, deployer.progress());
        }
        Ok(new_events)
    }

    async fn dispatch(
        &self,
        store: &mut StackStateStore,
        roles: &BTreeMap<&str, Option<&str>>,
    ) -> Result<()> {
        let sink = self.deployer.progress();
        let mode = self.options.monitor;
        let round_limit = store.len() + 1;

        for round in 1..=round_limit {
            if self.cancel.is_cancelled() {
                let skipped = store.skip_all_pending("removal was cancelled", sink);
                if !skipped.is_empty() {
                    warn!("Cancelled, {} stack(s) will not be removed", skipped.len());
                }
                return Ok(());
            }

            let ready: BTreeSet<String> = store.ready(&store.snapshot()).into_iter().collect();
            if ready.is_empty() {
                return Ok(());
            }
            debug!(
                "Round {round}: removing {}",
                ready.iter().cloned().collect::<Vec<_>>().join(", ")
            );

            for state in store.iter_mut().filter(|s| ready.contains(&s.name)) {
                state.start()?;
                sink.emit(ProgressEvent::StackStarted {
                    stack: state.name.clone(),
                    operation: Operation::Destroy,
                });
            }

            let deployer = &self.deployer;
            let results = join_all(store.iter_mut().filter(|s| ready.contains(&s.name)).map(
                move |state| async move {
                    let role_arn = roles.get(state.name.as_str()).copied().flatten();
                    let result = deployer
                        .destroy(&state.name, role_arn, mode, &mut state.events)
                        .await;
                    (state, result)
                },
            ))
            .await;

            let mut progressed = false;
            let mut failed = Vec::new();
            for (state, result) in results {
                match result {
                    Ok(DestroyOutcome::AlreadyGone | DestroyOutcome::Deleted) => {
                        state.succeed(StackOutputs::default())?;
                        info!("{}: removed", state.name);
                        sink.finished(state);
                        progressed = true;
                    }
                    Ok(DestroyOutcome::InProgress) => {
                        debug!("{}: removal in progress", state.name);
                    }
                    Err(e) => {
                        state.fail_with(&e, sink)?;
                        failed.push(state.name.clone());
                    }
                }
            }

            for name in &failed {
                store.skip_pending_stacks(name, self.options.failure_scope, sink);
            }

            if !progressed {
                return Ok(());
            }
        }

        Err(ScheduleError::RoundLimitExceeded {
            rounds: round_limit,
        }
        .into())
    }
}

async fn refresh_stack(
    deployer: &ChangeSetDeployer,
    state: &mut StackState,
) -> Result<(usize, Option<String>)> {
    let sink = deployer.progress();
    let name = state.name.clone();

    let new_events = match deployer.monitor().poll(&name, &mut state.events).await {
        Ok(count) => count,
        Err(e) if e.is_stack_not_found() => {
            state.succeed(StackOutputs::default())?;
            info!("{name}: removed");
            sink.finished(state);
            return Ok((0, None));
        }
        Err(e) => {
            let failed = state.fail_unless_transient(&e, sink)?;
            return Ok((0, failed.then_some(name)));
        }
    };

    let description = match deployer.describe(&name).await {
        Ok(description) => description,
        Err(e) => {
            let failed = state.fail_unless_transient(&e, sink)?;
            return Ok((new_events, failed.then_some(name)));
        }
    };

    match settle_destroy(&name, description.as_ref(), &state.events) {
        Ok(false) => Ok((new_events, None)),
        Ok(true) => {
            state.succeed(StackOutputs::default())?;
            info!("{name}: removed");
            sink.finished(state);
            Ok((new_events, None))
        }
        Err(e) => {
            state.fail_with(&e, sink)?;
            Ok((new_events, Some(name)))
        }
    }
}
