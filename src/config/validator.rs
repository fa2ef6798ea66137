//! Configuration validation for the manifest.
//!
//! This module validates a manifest before any control-plane call is made:
//! names, settings ranges and the shape of the stack graph.

use crate::cloud::DEFAULT_MAX_ATTEMPTS;
use crate::error::{ConfigError, Result, StackweaveError};
use crate::scheduler::StackGraph;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

use super::spec::{DeployConfig, ProjectConfig, SettingsConfig, StackConfig};
use crate::deploy::{DeploymentMethod, HotswapMode};

/// Maximum length of a fully qualified stack name.
pub const MAX_STACK_NAME_LEN: usize = 128;

/// Validator for manifests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a manifest.
    ///
    /// # Errors
    ///
    /// Returns the first error found; the full list is available through
    /// [`ConfigValidator::check`].
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            Err(StackweaveError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        } else {
            debug!("Configuration validation passed");
            Ok(result)
        }
    }

    /// Collects every error and warning of a manifest.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_settings(&config.settings, &mut result);
        Self::validate_stacks(config, &mut result);
        Self::validate_graph(&config.stacks, &mut result);

        result
    }

    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        for (field, value) in [("project.name", &project.name), ("project.stage", &project.stage)] {
            if value.is_empty() {
                result.error(field, format!("{field} cannot be empty"));
            } else if !is_valid_name(value) {
                result.error(
                    field,
                    format!(
                        "'{value}' is invalid. Must be letters, digits and hyphens, starting with a letter."
                    ),
                );
            }
        }

        if project.region.as_ref().is_some_and(String::is_empty) {
            result.error("project.region", "Region cannot be empty when set");
        }
    }

    fn validate_settings(settings: &SettingsConfig, result: &mut ValidationResult) {
        if settings.poll_interval_secs == 0 {
            result.error("settings.poll_interval_secs", "Poll interval must be at least 1 second");
        }

        if settings.max_passes == Some(0) {
            result.error("settings.max_passes", "max_passes must be at least 1");
        }

        if settings.wait_timeout_secs == 0 {
            result.error("settings.wait_timeout_secs", "Wait timeout must be at least 1 second");
        }

        let retry = &settings.retry;
        if retry.max_attempts == 0 {
            result.error("settings.retry.max_attempts", "At least one attempt is required");
        } else if retry.max_attempts > DEFAULT_MAX_ATTEMPTS * 4 {
            result.warning(format!(
                "settings.retry.max_attempts is {}; throttled runs may stall for a long time",
                retry.max_attempts
            ));
        }

        if retry.base_delay_ms > retry.max_delay_ms {
            result.error(
                "settings.retry.base_delay_ms",
                format!(
                    "Base delay ({} ms) exceeds the maximum delay ({} ms)",
                    retry.base_delay_ms, retry.max_delay_ms
                ),
            );
        }
    }

    fn validate_stacks(config: &DeployConfig, result: &mut ValidationResult) {
        if config.stacks.is_empty() {
            result.warning("No stacks defined in configuration");
            return;
        }

        let mut seen = HashSet::new();
        for (i, stack) in config.stacks.iter().enumerate() {
            let prefix = format!("stacks[{i}]");

            if !seen.insert(stack.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate stack name: {}", stack.name),
                );
            }

            if !is_valid_name(&stack.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!(
                        "Stack name '{}' is invalid. Must be letters, digits and hyphens, starting with a letter.",
                        stack.name
                    ),
                );
            }

            let full_name = config.stack_name(&stack.name);
            if full_name.len() > MAX_STACK_NAME_LEN {
                result.error(
                    format!("{prefix}.name"),
                    format!("Stack name '{full_name}' exceeds {MAX_STACK_NAME_LEN} characters"),
                );
            }

            if stack.template.trim().is_empty() {
                result.error(format!("{prefix}.template"), "Template path cannot be empty");
            }

            Self::validate_stack_options(stack, &prefix, result);
        }
    }

    fn validate_stack_options(stack: &StackConfig, prefix: &str, result: &mut ValidationResult) {
        if !stack.resources_to_import.is_empty()
            && matches!(stack.method, DeploymentMethod::Direct { .. })
        {
            result.error(
                format!("{prefix}.method"),
                format!("Stack '{}' imports resources and requires a change set", stack.name),
            );
        }

        if stack.method.change_set_name().is_empty() {
            result.error(
                format!("{prefix}.method.change_set_name"),
                "Change set name cannot be empty",
            );
        }

        if !stack.rollback {
            result.warning(format!(
                "Stack '{}' disables rollback; failed updates leave resources half-applied",
                stack.name
            ));
        }

        if stack.hotswap == HotswapMode::HotswapOnly {
            result.warning(format!(
                "Stack '{}' is hotswap-only; changes that cannot be hotswapped are not deployed",
                stack.name
            ));
        }
    }

    fn validate_graph(stacks: &[StackConfig], result: &mut ValidationResult) {
        let names: HashSet<&str> = stacks.iter().map(|s| s.name.as_str()).collect();
        let mut edges: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();

        for (i, stack) in stacks.iter().enumerate() {
            for dep in &stack.depends_on {
                if dep == &stack.name {
                    result.error(
                        format!("stacks[{i}].depends_on"),
                        format!("Stack '{}' depends on itself", stack.name),
                    );
                } else if !names.contains(dep.as_str()) {
                    result.error(
                        format!("stacks[{i}].depends_on"),
                        format!("Stack '{}' depends on unknown stack '{dep}'", stack.name),
                    );
                }
            }
            edges
                .entry(stack.name.as_str())
                .or_default()
                .extend(stack.depends_on.iter().cloned());
        }

        // Cycle detection needs a well-formed node set
        if !result.is_valid() {
            return;
        }

        if let Err(StackweaveError::Config(ConfigError::CircularDependency { cycle })) =
            StackGraph::build(edges.iter().map(|(name, deps)| (*name, deps)))
        {
            result.error("stacks", format!("Circular dependency detected: {cycle}"));
        }
    }
}

/// Validates that a name can be part of a stack name.
/// Names are letters, digits and hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }

    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
