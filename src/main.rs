//! Stackweave CLI entrypoint.
//!
//! This is the main entrypoint for the stackweave command-line tool.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use stackweave::cli::{Cli, Commands, DiffEntry, OutputFormatter, StateCommands, StatusEntry};
use stackweave::cloud::{CloudFormationClient, S3AssetPublisher, load_aws_config};
use stackweave::config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig, find_config_file};
use stackweave::deploy::{ChangeSetDeployer, CurrentStack, SkipDeployAnalyzer, StackSpec};
use stackweave::error::{Result, StackweaveError};
use stackweave::scheduler::{
    CancellationSignal, DeployScheduler, DestroyScheduler, Operation, ProgressSink, RunReport,
    select_stacks,
};
use stackweave::state::{DeploymentState, LocalStateStore, StateStore, generate_holder_id};

use clap::Parser;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point. Returns whether the command succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Deploy { stacks, force } => {
            cmd_deploy(config_path, &stacks, force, &formatter).await
        }
        Commands::Remove { stacks } => cmd_remove(config_path, &stacks, &formatter).await,
        Commands::Diff { stacks } => cmd_diff(config_path, &stacks, &formatter).await,
        Commands::Status => cmd_status(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::for_manifest(&config_file);
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    let valid = result.is_valid();

    // Templates are only checked once the manifest itself is sound
    if valid {
        let specs = parser.stack_specs(&config)?;
        debug!("Loaded {} template(s)", specs.len());
    }

    emit(formatter, &formatter.format_validation(&config, &result, show_warnings))?;
    Ok(valid)
}

/// Deploy the selected stacks.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    selection: &[String],
    force: bool,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = Project::load(config_path)?;
    let mut specs = project.select(selection, Operation::Deploy)?;
    if force {
        for spec in &mut specs {
            spec.options.force = true;
        }
    }

    let template_hashes: BTreeMap<String, String> = specs
        .iter()
        .map(|s| (s.name.clone(), s.template.hash()))
        .collect();

    let (sink, renderer) = spawn_renderer(*formatter);
    let (deployer, publisher) = project.deployer(sink).await;
    let mut scheduler = DeployScheduler::new(deployer)
        .with_options(project.config.settings.scheduler_options())
        .with_cancellation(cancel_on_ctrl_c());
    if let Some(publisher) = publisher {
        scheduler = scheduler.with_bootstrapper(publisher);
    }

    let report = project
        .locked(Operation::Deploy, async move { scheduler.run(&specs).await }, &template_hashes)
        .await;
    finish_renderer(renderer).await;

    let report = report?;
    emit(formatter, &formatter.format_report(&report))?;
    Ok(report.is_completed && !report.has_failures())
}

/// Remove the selected stacks.
async fn cmd_remove(
    config_path: Option<&PathBuf>,
    selection: &[String],
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = Project::load(config_path)?;
    let specs = project.select(selection, Operation::Destroy)?;

    let (sink, renderer) = spawn_renderer(*formatter);
    let (deployer, _) = project.deployer(sink).await;
    let scheduler = DestroyScheduler::new(deployer)
        .with_options(project.config.settings.scheduler_options())
        .with_cancellation(cancel_on_ctrl_c());

    let report = project
        .locked(Operation::Destroy, async move { scheduler.run(&specs).await }, &BTreeMap::new())
        .await;
    finish_renderer(renderer).await;

    let report = report?;
    emit(formatter, &formatter.format_report(&report))?;
    Ok(report.is_completed && !report.has_failures())
}

/// Show which stacks a deploy would change.
async fn cmd_diff(
    config_path: Option<&PathBuf>,
    selection: &[String],
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = Project::load(config_path)?;
    let specs = project.select(selection, Operation::Deploy)?;
    let recorded = project.store.load().await?;
    let (deployer, _) = project.deployer(ProgressSink::disabled()).await;
    let analyzer = SkipDeployAnalyzer::new();

    let mut entries = Vec::with_capacity(specs.len());
    for spec in &specs {
        let description = deployer.describe(&spec.name).await?;
        let template = match &description {
            Some(_) => Some(
                deployer
                    .retry()
                    .run("get_template", || deployer.client().get_template(&spec.name))
                    .await?,
            ),
            None => None,
        };
        let current = description
            .as_ref()
            .zip(template.as_deref())
            .map(|(description, template)| CurrentStack { description, template });

        let recorded_hash = recorded
            .as_ref()
            .and_then(|s| s.get_stack(&spec.name))
            .map(|r| r.template_hash.as_str());

        entries.push(DiffEntry {
            stack: spec.name.clone(),
            decision: analyzer.evaluate(spec, current),
            changed_since_last_run: recorded_hash
                .is_some_and(|h| !ConfigHasher::hashes_match(h, &spec.template.hash())),
        });
    }

    emit(formatter, &formatter.format_diff(&entries))?;
    Ok(true)
}

/// Show the live status of every stack.
async fn cmd_status(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<bool> {
    let project = Project::load(config_path)?;
    let recorded = project.store.load().await?;
    let (deployer, _) = project.deployer(ProgressSink::disabled()).await;

    let mut entries = Vec::with_capacity(project.config.stacks.len());
    for stack in &project.config.stacks {
        let name = project.config.stack_name(&stack.name);
        let description = deployer.describe(&name).await?;

        entries.push(StatusEntry {
            remote_status: description.as_ref().map(|d| d.status.as_str().to_string()),
            last_run: recorded
                .as_ref()
                .and_then(|s| s.get_stack(&name))
                .map(|r| r.status),
            outputs: description
                .map(|d| d.output_map().into_iter().collect())
                .unwrap_or_default(),
            stack: name,
        });
    }

    emit(formatter, &formatter.format_stack_status(&project.config, &entries))?;
    Ok(true)
}

/// Run-record commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<bool> {
    let project = Project::load(config_path)?;
    let store = &project.store;

    match command {
        StateCommands::Show => {
            let lock = store.get_lock_info().await?;
            if let Some(state) = store.load().await? {
                emit(formatter, &formatter.format_state(&state, lock.as_ref()))?;
            } else {
                eprintln!("No state found at {}.", project.store.state_path().display());
            }
        }
        StateCommands::Unlock { lock_id } => {
            if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else if let Some(lock) = store.force_unlock().await? {
                eprintln!("Removed lock held by {} since {}.", lock.holder, lock.acquired_at);
            } else {
                eprintln!("State is not locked.");
            }
        }
    }

    Ok(true)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A loaded and validated manifest with its run-record store.
struct Project {
    config: DeployConfig,
    parser: ConfigParser,
    store: LocalStateStore,
}

impl Project {
    /// Loads, overrides and validates the manifest.
    fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let parser = ConfigParser::for_manifest(&config_file);
        parser.load_dotenv()?;
        let config = parser.load_with_env(&config_file)?;

        let result = ConfigValidator::new().validate(&config)?;
        for warning in &result.warnings {
            warn!("{warning}");
        }

        let store = LocalStateStore::for_manifest(
            parser.base_path(),
            config.state.dir.as_deref(),
            &config.project.stage,
        );

        Ok(Self {
            config,
            parser,
            store,
        })
    }

    /// Stack specs restricted to the selected short names.
    fn select(&self, selection: &[String], operation: Operation) -> Result<Vec<StackSpec>> {
        let specs = self.parser.stack_specs(&self.config)?;
        let roots: Vec<String> = selection.iter().map(|s| self.config.stack_name(s)).collect();
        select_stacks(&specs, &roots, operation)
    }

    /// Builds a deployer, and the toolkit publisher when one is configured.
    async fn deployer(&self, sink: ProgressSink) -> (ChangeSetDeployer, Option<Arc<S3AssetPublisher>>) {
        let sdk_config = load_aws_config(self.config.project.region.as_deref()).await;
        let settings = &self.config.settings;

        let mut deployer = ChangeSetDeployer::new(Arc::new(CloudFormationClient::new(&sdk_config)))
            .with_retry(settings.retry_policy())
            .with_wait_timeout(settings.wait_timeout())
            .with_progress(sink);

        let publisher = self.config.toolkit.assets_bucket.as_deref().map(|bucket| {
            Arc::new(S3AssetPublisher::new(
                &sdk_config,
                bucket,
                self.config.toolkit.assets_prefix.as_deref(),
            ))
        });
        if let Some(publisher) = &publisher {
            deployer = deployer.with_assets(publisher.clone());
        }

        (deployer, publisher)
    }

    /// Runs `scheduler` under the run lock and records its report.
    async fn locked<F>(
        &self,
        operation: Operation,
        scheduler: F,
        template_hashes: &BTreeMap<String, String>,
    ) -> Result<RunReport>
    where
        F: Future<Output = Result<RunReport>>,
    {
        let holder = format!("{} ({operation})", generate_holder_id());
        let lock = self.store.acquire_lock(&holder).await?;
        info!("{operation}: {}/{}", self.config.project.name, self.config.project.stage);

        let result = self.record(scheduler.await, template_hashes).await;
        self.store.release_lock(&lock.lock_id).await?;
        result
    }

    async fn record(
        &self,
        report: Result<RunReport>,
        template_hashes: &BTreeMap<String, String>,
    ) -> Result<RunReport> {
        let report = report?;
        let mut state = self.store.load().await?.unwrap_or_else(|| {
            DeploymentState::new(&self.config.project.name, &self.config.project.stage)
        });
        let config_hash = ConfigHasher::new().hash_config(&self.config);
        state.apply_report(&report, template_hashes, &config_hash);
        self.store.save(&state).await?;
        Ok(report)
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Spawns the task rendering progress events to stderr.
fn spawn_renderer(formatter: OutputFormatter) -> (ProgressSink, JoinHandle<()>) {
    let (sink, mut rx) = ProgressSink::channel();
    let handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Some(line) = formatter.format_event(&event) {
                eprintln!("{line}");
            }
        }
    });
    (sink, handle)
}

/// Waits for the renderer to drain; the stream ends once every sink is gone.
async fn finish_renderer(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!("Progress renderer stopped: {e}");
    }
}

/// Trips the returned signal on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationSignal {
    let (tx, signal) = CancellationSignal::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, waiting for stacks in progress to settle");
            let _ = tx.send(true);
        }
    });
    signal
}

/// Writes command output: JSON to stdout, text to stderr.
fn emit(formatter: &OutputFormatter, output: &str) -> Result<()> {
    if formatter.is_json() {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{output}").map_err(StackweaveError::Io)?;
    } else {
        eprintln!("{output}");
    }
    Ok(())
}
