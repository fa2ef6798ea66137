//! Configuration parser for loading the manifest and its templates.
//!
//! This module handles loading the manifest from YAML and environment
//! variables, with proper precedence and error handling, and turns stack
//! entries into [`StackSpec`]s with their templates loaded from disk.

use crate::deploy::{StackSpec, StackTemplate};
use crate::error::{ConfigError, Result, StackweaveError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::DeployConfig;

/// Environment variable overriding `project.name`.
pub const ENV_PROJECT_NAME: &str = "STACKWEAVE_PROJECT_NAME";
/// Environment variable overriding `project.stage`.
pub const ENV_PROJECT_STAGE: &str = "STACKWEAVE_PROJECT_STAGE";
/// Environment variable overriding `project.region`.
pub const ENV_REGION: &str = "STACKWEAVE_REGION";
/// Environment variable overriding `toolkit.assets_bucket`.
pub const ENV_ASSETS_BUCKET: &str = "STACKWEAVE_ASSETS_BUCKET";

/// Configuration parser for loading the manifest.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving template paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Creates a parser whose base path is the manifest's directory.
    #[must_use]
    pub fn for_manifest(path: &Path) -> Self {
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::new().with_base_path(base)
    }

    /// Base path for resolving relative paths.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        self.base_path.as_deref().unwrap_or_else(|| Path::new("."))
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })?;

        debug!(
            "Parsed configuration for {}/{} with {} stack(s)",
            config.project.name,
            config.project.stage,
            config.stacks.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |name| std::env::var(name).ok());
        Ok(config)
    }

    /// Loads the .env file next to the manifest if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self.base_path().join(".env");

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Builds the stack specifications of the manifest.
    ///
    /// Stack and dependency names are qualified with the stage and project,
    /// and templates are read relative to the base path.
    ///
    /// # Errors
    ///
    /// Returns an error if a template is missing or is not a JSON or YAML
    /// mapping.
    pub fn stack_specs(&self, config: &DeployConfig) -> Result<Vec<StackSpec>> {
        config
            .stacks
            .iter()
            .map(|stack| {
                let name = config.stack_name(&stack.name);
                let path = self.base_path().join(&stack.template);
                if !path.exists() {
                    return Err(ConfigError::FileNotFound { path }.into());
                }

                let raw = std::fs::read_to_string(&path).map_err(StackweaveError::Io)?;
                let template = StackTemplate::parse(&name, raw)?;
                debug!("{name}: loaded {} byte template from {}", template.len(), path.display());

                Ok(StackSpec::new(name, template)
                    .depends_on(stack.depends_on.iter().map(|d| config.stack_name(d)))
                    .with_options(stack.deploy_options()))
            })
            .collect()
    }
}

/// Applies environment overrides, reading variables through `lookup`.
pub fn apply_overrides(config: &mut DeployConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(name) = lookup(ENV_PROJECT_NAME) {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }

    if let Some(stage) = lookup(ENV_PROJECT_STAGE) {
        debug!("Overriding project.stage from environment");
        config.project.stage = stage;
    }

    if let Some(region) = lookup(ENV_REGION) {
        debug!("Overriding project.region from environment");
        config.project.region = Some(region);
    }

    if let Some(bucket) = lookup(ENV_ASSETS_BUCKET) {
        debug!("Overriding toolkit.assets_bucket from environment");
        config.toolkit.assets_bucket = Some(bucket);
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["stackweave.yaml", "stackweave.yml"];

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
