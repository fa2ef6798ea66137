//! Configuration module for the stackweave orchestrator.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `stackweave.yaml`
//! - Validation of configuration values and the stack graph
//! - Computing configuration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    DeployConfig, ProjectConfig, RetryConfig, SettingsConfig, StackConfig, StateConfig,
    ToolkitConfig,
};
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_ASSETS_BUCKET, ENV_PROJECT_NAME, ENV_PROJECT_STAGE,
    ENV_REGION, apply_overrides, find_config_file,
};
pub use validator::{ConfigValidator, MAX_STACK_NAME_LEN, ValidationError, ValidationResult};
pub use hash::ConfigHasher;
