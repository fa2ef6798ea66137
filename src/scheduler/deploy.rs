//! Dependency-ordered deployment of a stack graph.
//!
//! A run is a sequence of passes. Each pass refreshes the stacks still in
//! flight, then dispatches ready stacks in rounds until a round resolves
//! nothing. Stacks whose operation is still running are picked up again by
//! the next pass.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::cloud::Bootstrapper;
use crate::deploy::{
    ChangeSetDeployer, DeployOutcome, EventLog, StackOutputs, StackSpec, settle_deploy,
};
use crate::error::{Result, ScheduleError, StackweaveError};

use super::control::{CancellationSignal, SchedulerOptions};
use super::progress::ProgressEvent;
use super::state::{Operation, RunReport, StackState, StackStateStore, StackStatus};

/// Deploys a set of stacks in dependency order.
pub struct DeployScheduler {
    deployer: ChangeSetDeployer,
    bootstrapper: Option<Arc<dyn Bootstrapper>>,
    options: SchedulerOptions,
    cancel: CancellationSignal,
}

impl DeployScheduler {
    /// Creates a scheduler around a deployer.
    #[must_use]
    pub fn new(deployer: ChangeSetDeployer) -> Self {
        Self {
            deployer,
            bootstrapper: None,
            options: SchedulerOptions::default(),
            cancel: CancellationSignal::never(),
        }
    }

    /// Sets the action run once when a stack needs the toolkit resources.
    #[must_use]
    pub fn with_bootstrapper(mut self, bootstrapper: Arc<dyn Bootstrapper>) -> Self {
        self.bootstrapper = Some(bootstrapper);
        self
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

    /// Deploys every stack in `specs`.
    ///
    /// Per-stack failures are recorded in the report and never abort the
    /// run.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid dependency graph or a broken state
    /// machine invariant.
    pub async fn run(&self, specs: &[StackSpec]) -> Result<RunReport> {
        let mut store = StackStateStore::for_deploy(specs)?;
        let by_name: BTreeMap<&str, &StackSpec> =
            specs.iter().map(|s| (s.name.as_str(), s)).collect();
        let bootstrap = OnceCell::new();
        let sink = self.deployer.progress();

        info!("Deploying {} stack(s)", store.len());

        let mut pass = 0;
        loop {
            pass += 1;
            let new_events = self.refresh(&mut store).await?;
            self.dispatch(&mut store, &by_name, &bootstrap).await?;

            if store.is_completed() {
                break;
            }

            if self.options.max_passes.is_some_and(|max| pass >= max) {
                warn!(
                    "Stopping after {pass} pass(es) with {} stack(s) still in flight",
                    store.in_flight().len()
                );
                break;
            }

            if new_events == 0 {
                debug!("Checking deploy status...");
            }
            sink.emit(ProgressEvent::Waiting { pass, new_events });
            tokio::time::sleep(self.options.poll_interval).await;
        }

        let report = store.into_report(pass);
        info!(
            "Deploy finished: {} deployed, {} unchanged, {} failed, {} skipped",
            report.count(StackStatus::Succeeded),
            report.count(StackStatus::Unchanged),
            report.count(StackStatus::Failed),
            report.count(StackStatus::Skipped)
        );
        Ok(report)
    }

    /// Refreshes every deploying stack and returns the number of new events.
    async fn refresh(&self, store: &mut StackStateStore) -> Result<usize> {
        let deployer = &self.deployer;
        let results = join_all(
            store
                .iter_mut()
                .filter(|s| s.status() == StackStatus::Deploying)
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

    /// Dispatches ready stacks until a round resolves nothing.
    async fn dispatch(
        &self,
        store: &mut StackStateStore,
        specs: &BTreeMap<&str, &StackSpec>,
        bootstrap: &OnceCell<()>,
    ) -> Result<()> {
        let sink = self.deployer.progress();
        let round_limit = store.len() + 1;

        for round in 1..=round_limit {
            if self.cancel.is_cancelled() {
                let skipped = store.skip_all_pending("deployment was cancelled", sink);
                if !skipped.is_empty() {
                    warn!("Cancelled, {} stack(s) will not be deployed", skipped.len());
                }
                return Ok(());
            }

            let ready: BTreeSet<String> = store.ready(&store.snapshot()).into_iter().collect();
            if ready.is_empty() {
                return Ok(());
            }
            debug!(
                "Round {round}: dispatching {}",
                ready.iter().cloned().collect::<Vec<_>>().join(", ")
            );

            for state in store.iter_mut().filter(|s| ready.contains(&s.name)) {
                state.start()?;
                sink.emit(ProgressEvent::StackStarted {
                    stack: state.name.clone(),
                    operation: Operation::Deploy,
                });
            }

            let results = join_all(store.iter_mut().filter(|s| ready.contains(&s.name)).map(
                move |state| async move {
                    let result = match specs.get(state.name.as_str()) {
                        Some(spec) => self.deploy_stack(spec, &mut state.events, bootstrap).await,
                        None => Err(StackweaveError::internal(format!(
                            "no stack definition for {}",
                            state.name
                        ))),
                    };
                    (state, result)
                },
            ))
            .await;

            let mut progressed = false;
            let mut failed = Vec::new();
            for (state, result) in results {
                match result {
                    Ok(DeployOutcome::NoOp(outputs)) => {
                        state.unchanged(outputs)?;
                        info!("{}: no changes", state.name);
                        sink.finished(state);
                        progressed = true;
                    }
                    Ok(DeployOutcome::ReviewPending { change_set_id }) => {
                        state.unchanged(StackOutputs::default())?;
                        info!("{}: change set {change_set_id} left for review", state.name);
                        sink.finished(state);
                        progressed = true;
                    }
                    Ok(DeployOutcome::Updated(outputs)) => {
                        state.succeed(outputs)?;
                        info!("{}: deployed", state.name);
                        sink.finished(state);
                        progressed = true;
                    }
                    Ok(DeployOutcome::InProgress) => {
                        debug!("{}: deployment in progress", state.name);
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

    /// Deploys one stack, bootstrapping once per run when required.
    async fn deploy_stack(
        &self,
        spec: &StackSpec,
        log: &mut EventLog,
        bootstrap: &OnceCell<()>,
    ) -> Result<DeployOutcome> {
        let mode = self.options.monitor;
        match self.deployer.deploy(spec, mode, log).await {
            Err(e) if e.is_bootstrap_required() => {
                let Some(bootstrapper) = &self.bootstrapper else {
                    return Err(e);
                };

                bootstrap
                    .get_or_try_init(|| async {
                        info!("Bootstrapping toolkit resources");
                        self.deployer.progress().emit(ProgressEvent::Bootstrapping);
                        self.deployer
                            .retry()
                            .run("bootstrap", || bootstrapper.bootstrap())
                            .await
                    })
                    .await?;

                info!("{}: retrying after bootstrap", spec.name);
                self.deployer.deploy(spec, mode, log).await
            }
            result => result,
        }
    }
}

/// Refreshes one deploying stack.
///
/// Returns the number of new events and the stack name when it failed.
async fn refresh_stack(
    deployer: &ChangeSetDeployer,
    state: &mut StackState,
) -> Result<(usize, Option<String>)> {
    let sink = deployer.progress();
    let name = state.name.clone();

    let new_events = match deployer.monitor().poll(&name, &mut state.events).await {
        Ok(count) => count,
        // The describe below reports the vanished stack.
        Err(e) if e.is_stack_not_found() => 0,
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

    match settle_deploy(&name, description.as_ref(), &state.events) {
        Ok(None) => Ok((new_events, None)),
        Ok(Some(outputs)) => {
            state.succeed(outputs)?;
            info!("{name}: deployed");
            sink.finished(state);
            Ok((new_events, None))
        }
        Err(e) => {
            state.fail_with(&e, sink)?;
            Ok((new_events, Some(name)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fake::FakeControlPlane;
    use crate::cloud::{AssetPublisher, INLINE_TEMPLATE_LIMIT, RetryPolicy, bootstrap_required};
    use crate::deploy::StackTemplate;
    use crate::error::ControlPlaneError;
    use crate::scheduler::{FailureScope, ProgressSink, StackGraph};
    use async_trait::async_trait;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    fn template() -> StackTemplate {
        StackTemplate::from_value(json!({"Resources": {"Bucket": {"Type": "AWS::S3::Bucket"}}}))
    }

    fn spec(name: &str, deps: &[&str]) -> StackSpec {
        StackSpec::new(name, template()).depends_on(deps.iter().copied())
    }

    fn deployer(fake: &Arc<FakeControlPlane>) -> ChangeSetDeployer {
        ChangeSetDeployer::new(fake.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1)))
            .with_poll_interval(Duration::from_millis(1))
    }

    fn options() -> SchedulerOptions {
        SchedulerOptions {
            poll_interval: Duration::from_millis(1),
            ..SchedulerOptions::default()
        }
    }

    fn scheduler(fake: &Arc<FakeControlPlane>) -> DeployScheduler {
        DeployScheduler::new(deployer(fake)).with_options(options())
    }

    fn created_before(fake: &FakeControlPlane, first: &str, second: &str) -> bool {
        match (
            fake.first_call("create_change_set", first),
            fake.first_call("create_change_set", second),
        ) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    #[tokio::test]
    async fn test_dependents_deploy_after_their_dependency() {
        let fake = Arc::new(FakeControlPlane::new());
        let specs = vec![spec("a", &[]), spec("b", &["a"]), spec("c", &["a"])];

        let report = scheduler(&fake).run(&specs).await.expect("run");

        assert!(report.is_completed);
        assert!(!report.has_failures());
        assert_eq!(report.count(StackStatus::Succeeded), 3);
        assert!(created_before(&fake, "a", "b"));
        assert!(created_before(&fake, "a", "c"));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents_only() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.fail_deploy("a", "Bucket name already taken");
        let specs = vec![spec("a", &[]), spec("b", &["a"]), spec("x", &[])];

        let report = scheduler(&fake).run(&specs).await.expect("run");

        assert!(report.is_completed);
        assert_eq!(report.status_of("a"), Some(StackStatus::Failed));
        assert_eq!(report.status_of("b"), Some(StackStatus::Skipped));
        assert_eq!(report.status_of("x"), Some(StackStatus::Succeeded));
        let message = report
            .get("a")
            .and_then(|s| s.error_message.clone())
            .unwrap_or_default();
        assert!(message.contains("failed creation"), "{message}");
        assert!(fake.first_call("create_change_set", "b").is_none());
    }

    #[tokio::test]
    async fn test_all_pending_scope_skips_unrelated_branches() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.fail_deploy("a", "Bucket name already taken");
        let specs = vec![
            spec("a", &[]),
            spec("b", &["a"]),
            spec("x", &[]),
            spec("y", &["x"]),
        ];

        let report = DeployScheduler::new(deployer(&fake))
            .with_options(SchedulerOptions {
                failure_scope: FailureScope::AllPending,
                ..options()
            })
            .run(&specs)
            .await
            .expect("run");

        assert_eq!(report.status_of("a"), Some(StackStatus::Failed));
        assert_eq!(report.status_of("b"), Some(StackStatus::Skipped));
        assert_eq!(report.status_of("x"), Some(StackStatus::Succeeded));
        assert_eq!(report.status_of("y"), Some(StackStatus::Skipped));
    }

    #[tokio::test]
    async fn test_empty_template_fails_without_remote_calls() {
        let fake = Arc::new(FakeControlPlane::new());
        let specs = vec![
            StackSpec::new("empty", StackTemplate::from_value(json!({"Resources": {}}))),
            spec("after", &["empty"]),
        ];

        let report = scheduler(&fake).run(&specs).await.expect("run");

        assert_eq!(report.status_of("empty"), Some(StackStatus::Failed));
        assert_eq!(report.status_of("after"), Some(StackStatus::Skipped));
        let message = report
            .get("empty")
            .and_then(|s| s.error_message.clone())
            .unwrap_or_default();
        assert_eq!(message, "The empty stack contains no resources.");
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_second_identical_run_is_unchanged() {
        let fake = Arc::new(FakeControlPlane::new());
        let specs = vec![spec("a", &[]), spec("b", &["a"])];
        let scheduler = scheduler(&fake);

        scheduler.run(&specs).await.expect("first run");
        let before = fake.mutating_calls().len();

        let report = scheduler.run(&specs).await.expect("second run");

        assert_eq!(report.count(StackStatus::Unchanged), 2);
        assert_eq!(report.passes, 1);
        assert_eq!(fake.mutating_calls().len(), before);
    }

    #[tokio::test]
    async fn test_in_flight_stacks_are_refreshed_on_later_passes() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.settle_after(3);
        let specs = vec![spec("a", &[]), spec("b", &["a"])];
        let (sink, mut rx) = ProgressSink::channel();

        let report = DeployScheduler::new(deployer(&fake).with_progress(sink))
            .with_options(options())
            .run(&specs)
            .await
            .expect("run");

        assert_eq!(report.count(StackStatus::Succeeded), 2);
        assert!(report.passes >= 4, "passes: {}", report.passes);

        let mut waits = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ProgressEvent::Waiting { .. }) {
                waits += 1;
            }
        }
        assert_eq!(waits, report.passes - 1);
    }

    #[tokio::test]
    async fn test_throttled_refresh_is_checked_again_next_pass() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.settle_after(2);
        // Outlasts the whole retry budget of one refresh.
        fake.throttle("describe_stack_events", "a", 3);
        let specs = vec![spec("a", &[]), spec("b", &["a"])];

        let report = scheduler(&fake).run(&specs).await.expect("run");

        assert!(report.is_completed);
        assert_eq!(report.status_of("a"), Some(StackStatus::Succeeded));
        assert_eq!(report.status_of("b"), Some(StackStatus::Succeeded));
        let event_polls = fake
            .calls()
            .iter()
            .filter(|c| c.operation == "describe_stack_events" && c.stack == "a")
            .count();
        assert!(event_polls > 3, "event polls: {event_polls}");
    }

    #[tokio::test]
    async fn test_max_passes_leaves_run_incomplete() {
        let fake = Arc::new(FakeControlPlane::new());
        fake.settle_after(100);

        let report = DeployScheduler::new(deployer(&fake))
            .with_options(SchedulerOptions {
                max_passes: Some(2),
                ..options()
            })
            .run(&[spec("a", &[])])
            .await
            .expect("run");

        assert!(!report.is_completed);
        assert_eq!(report.passes, 2);
        assert_eq!(report.status_of("a"), Some(StackStatus::Deploying));
    }

    #[tokio::test]
    async fn test_cancelled_run_skips_pending_stacks() {
        let fake = Arc::new(FakeControlPlane::new());
        let (tx, signal) = CancellationSignal::new();
        tx.send(true).expect("receiver alive");

        let report = scheduler(&fake)
            .with_cancellation(signal)
            .run(&[spec("a", &[]), spec("b", &["a"])])
            .await
            .expect("run");

        assert!(report.is_completed);
        assert_eq!(report.count(StackStatus::Skipped), 2);
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_graph_is_rejected() {
        let fake = Arc::new(FakeControlPlane::new());
        let result = scheduler(&fake)
            .run(&[spec("a", &["b"]), spec("b", &["a"])])
            .await;
        assert!(result.is_err());
        assert!(fake.calls().is_empty());
    }

    struct GatedPublisher {
        ready: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AssetPublisher for GatedPublisher {
        async fn stage_template(&self, stack_name: &str, _body: &str) -> Result<String> {
            if self.ready.load(Ordering::SeqCst) {
                Ok(format!("https://assets.example/{stack_name}.json"))
            } else {
                Err(bootstrap_required("staging bucket does not exist"))
            }
        }
    }

    struct CountingBootstrapper {
        ready: Arc<AtomicBool>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Bootstrapper for CountingBootstrapper {
        async fn bootstrap(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bootstrap_runs_once_per_run() {
        let fake = Arc::new(FakeControlPlane::new());
        let ready = Arc::new(AtomicBool::new(false));
        let bootstrapper = Arc::new(CountingBootstrapper {
            ready: ready.clone(),
            calls: AtomicU32::new(0),
        });

        let report = DeployScheduler::new(
            deployer(&fake).with_assets(Arc::new(GatedPublisher { ready })),
        )
        .with_options(options())
        .with_bootstrapper(bootstrapper.clone())
        .run(&[big("a"), big("b")])
        .await
        .expect("run");

        assert_eq!(report.count(StackStatus::Succeeded), 2);
        assert_eq!(bootstrapper.calls.load(Ordering::SeqCst), 1);
    }

    /// Fails with a throttling error `failures` times before creating the bucket.
    struct FlakyBootstrapper {
        ready: Arc<AtomicBool>,
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Bootstrapper for FlakyBootstrapper {
        async fn bootstrap(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(ControlPlaneError::throttled("SlowDown").into());
            }
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Throttles the first upload, then accepts every template.
    struct ThrottledOncePublisher {
        throttled: AtomicBool,
    }

    #[async_trait]
    impl AssetPublisher for ThrottledOncePublisher {
        async fn stage_template(&self, stack_name: &str, _body: &str) -> Result<String> {
            if !self.throttled.swap(true, Ordering::SeqCst) {
                return Err(ControlPlaneError::throttled("SlowDown").into());
            }
            Ok(format!("https://assets.example/{stack_name}.json"))
        }
    }

    fn big(name: &str) -> StackSpec {
        let padding = "x".repeat(INLINE_TEMPLATE_LIMIT);
        StackSpec::new(
            name,
            StackTemplate::from_value(json!({
                "Resources": {"Bucket": {"Type": "AWS::S3::Bucket", "Metadata": {"Padding": padding}}}
            })),
        )
    }

    #[tokio::test]
    async fn test_transient_bootstrap_failure_is_retried() {
        let fake = Arc::new(FakeControlPlane::new());
        let ready = Arc::new(AtomicBool::new(false));
        let bootstrapper = Arc::new(FlakyBootstrapper {
            ready: ready.clone(),
            failures: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });

        let report = DeployScheduler::new(
            deployer(&fake).with_assets(Arc::new(GatedPublisher { ready })),
        )
        .with_options(options())
        .with_bootstrapper(bootstrapper.clone())
        .run(&[big("a")])
        .await
        .expect("run");

        assert_eq!(report.status_of("a"), Some(StackStatus::Succeeded));
        assert_eq!(bootstrapper.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_throttled_staging_is_retried() {
        let fake = Arc::new(FakeControlPlane::new());

        let report = DeployScheduler::new(deployer(&fake).with_assets(Arc::new(
            ThrottledOncePublisher {
                throttled: AtomicBool::new(false),
            },
        )))
        .with_options(options())
        .run(&[big("a")])
        .await
        .expect("run");

        assert_eq!(report.status_of("a"), Some(StackStatus::Succeeded));
    }

    #[tokio::test]
    async fn test_bootstrap_required_without_bootstrapper_fails_stack() {
        let fake = Arc::new(FakeControlPlane::new());

        let report = scheduler(&fake).run(&[big("big")]).await.expect("run");

        assert_eq!(report.status_of("big"), Some(StackStatus::Failed));
        assert!(fake.mutating_calls().is_empty());
    }

    /// Stack `i` depends on every `j < i` whose bit is set in `masks[i]`.
    fn random_specs(masks: &[u8]) -> Vec<StackSpec> {
        masks
            .iter()
            .enumerate()
            .map(|(i, mask)| {
                let deps: Vec<String> = (0..i)
                    .filter(|j| mask & (1 << j) != 0)
                    .map(|j| format!("s{j}"))
                    .collect();
                StackSpec::new(format!("s{i}"), template()).depends_on(deps)
            })
            .collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_every_stack_is_created_after_its_dependencies(
            masks in proptest::collection::vec(any::<u8>(), 1..8)
        ) {
            let specs = random_specs(&masks);
            let fake = Arc::new(FakeControlPlane::new());

            let report = tokio_test::block_on(scheduler(&fake).run(&specs)).expect("run");

            prop_assert!(report.is_completed);
            prop_assert_eq!(report.count(StackStatus::Succeeded), specs.len());
            for spec in &specs {
                for dep in &spec.dependencies {
                    prop_assert!(created_before(&fake, dep, &spec.name));
                }
            }
        }

        #[test]
        fn prop_failure_skips_exactly_the_dependents(
            masks in proptest::collection::vec(any::<u8>(), 1..8),
            pick in any::<usize>(),
        ) {
            let specs = random_specs(&masks);
            let failing = format!("s{}", pick % specs.len());
            let fake = Arc::new(FakeControlPlane::new());
            fake.fail_deploy(&failing, "boom");

            let report = tokio_test::block_on(scheduler(&fake).run(&specs)).expect("run");

            let graph = StackGraph::build(specs.iter().map(|s| (s.name.as_str(), &s.dependencies)))
                .expect("valid graph");
            let affected = graph.reversed().closure([failing.as_str()]);

            prop_assert!(report.is_completed);
            for stack in &report.stacks {
                let expected = if stack.name == failing {
                    StackStatus::Failed
                } else if affected.contains(&stack.name) {
                    StackStatus::Skipped
                } else {
                    StackStatus::Succeeded
                };
                prop_assert_eq!(stack.status(), expected, "{}", stack.name);
            }
        }
    }
}
