//! Stack specifications handed to the deployer and schedulers.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cloud::ResourceToImport;
use crate::config::ConfigHasher;
use crate::error::{ConfigError, Result};

/// Default name of the change set created for a deployment.
pub const DEFAULT_CHANGE_SET_NAME: &str = "stackweave-deploy-change-set";

/// Prefix of parameter types resolved from the parameter store at deploy time.
const SSM_PARAMETER_TYPE_PREFIX: &str = "AWS::SSM::Parameter::Value<";

/// A synthesized template: the raw body plus a parsed view of it.
#[derive(Debug, Clone, PartialEq)]
pub struct StackTemplate {
    raw: String,
    parsed: serde_json::Value,
}

impl StackTemplate {
    /// Parses a JSON or YAML template body.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not a JSON or YAML mapping.
    pub fn parse(stack: &str, raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();

        let parsed: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(json_err) => serde_yaml::from_str(&raw).map_err(|yaml_err| {
                ConfigError::InvalidTemplate {
                    stack: stack.to_string(),
                    message: format!("not JSON ({json_err}) nor YAML ({yaml_err})"),
                }
            })?,
        };

        if !parsed.is_object() {
            return Err(ConfigError::InvalidTemplate {
                stack: stack.to_string(),
                message: String::from("template must be a mapping"),
            }
            .into());
        }

        Ok(Self { raw, parsed })
    }

    /// Builds a template from an already parsed document.
    #[must_use]
    pub fn from_value(parsed: serde_json::Value) -> Self {
        Self {
            raw: parsed.to_string(),
            parsed,
        }
    }

    /// The body exactly as it will be sent.
    #[must_use]
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed document.
    #[must_use]
    pub const fn parsed(&self) -> &serde_json::Value {
        &self.parsed
    }

    /// The `Resources` section, if present.
    #[must_use]
    pub fn resources(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        self.parsed.get("Resources").and_then(serde_json::Value::as_object)
    }

    /// Whether the template declares at least one resource.
    #[must_use]
    pub fn has_resources(&self) -> bool {
        self.resources().is_some_and(|r| !r.is_empty())
    }

    /// Whether any parameter is resolved from the parameter store, which
    /// means its effective value can change without the template changing.
    #[must_use]
    pub fn uses_parameter_store(&self) -> bool {
        self.parsed
            .get("Parameters")
            .and_then(serde_json::Value::as_object)
            .is_some_and(|params| {
                params.values().any(|p| {
                    p.get("Type")
                        .and_then(serde_json::Value::as_str)
                        .is_some_and(|t| t.starts_with(SSM_PARAMETER_TYPE_PREFIX))
                })
            })
    }

    /// SHA-256 of the raw body.
    #[must_use]
    pub fn hash(&self) -> String {
        ConfigHasher::new().hash_template(&self.raw)
    }

    /// Size of the raw body in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    /// Whether the raw body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// How hotswap short-circuits are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HotswapMode {
    /// Always perform a full deployment.
    #[default]
    FullDeployment,
    /// Try a hotswap, fall back to a full deployment.
    FallBack,
    /// Only hotswap; changes that cannot be hotswapped are left undeployed.
    HotswapOnly,
}

impl fmt::Display for HotswapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FullDeployment => write!(f, "full-deployment"),
            Self::FallBack => write!(f, "fall-back"),
            Self::HotswapOnly => write!(f, "hotswap-only"),
        }
    }
}

/// Deployment protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DeploymentMethod {
    /// Create a change set and optionally execute it.
    ChangeSet {
        /// Execute the change set once computed.
        #[serde(default = "default_true")]
        execute: bool,
        /// Change set name.
        #[serde(default)]
        change_set_name: Option<String>,
    },
    /// Call create or update directly.
    Direct {
        /// Return as soon as the operation is accepted.
        #[serde(default)]
        no_monitor: bool,
    },
}

const fn default_true() -> bool {
    true
}

impl Default for DeploymentMethod {
    fn default() -> Self {
        Self::ChangeSet {
            execute: true,
            change_set_name: None,
        }
    }
}

impl DeploymentMethod {
    /// Whether this deployment only prepares a change set for review.
    #[must_use]
    pub const fn is_review_only(&self) -> bool {
        matches!(self, Self::ChangeSet { execute: false, .. })
    }

    /// Change set name for change-set deployments.
    #[must_use]
    pub fn change_set_name(&self) -> &str {
        match self {
            Self::ChangeSet {
                change_set_name: Some(name),
                ..
            } => name,
            _ => DEFAULT_CHANGE_SET_NAME,
        }
    }
}

/// Per-stack deployment options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOptions {
    /// Role assumed by the control plane.
    pub role_arn: Option<String>,
    /// Stack tags.
    pub tags: BTreeMap<String, String>,
    /// Parameter values.
    pub parameters: BTreeMap<String, String>,
    /// Roll back on failure.
    pub rollback: bool,
    /// Termination protection.
    pub termination_protection: bool,
    /// Hotswap mode.
    pub hotswap: HotswapMode,
    /// Deployment protocol.
    pub method: DeploymentMethod,
    /// Deploy even when nothing changed.
    pub force: bool,
    /// Existing resources to import.
    pub resources_to_import: Vec<ResourceToImport>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            role_arn: None,
            tags: BTreeMap::new(),
            parameters: BTreeMap::new(),
            rollback: true,
            termination_protection: false,
            hotswap: HotswapMode::default(),
            method: DeploymentMethod::default(),
            force: false,
            resources_to_import: Vec::new(),
        }
    }
}

/// One stack of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct StackSpec {
    /// Fully qualified stack name.
    pub name: String,
    /// Template to deploy.
    pub template: StackTemplate,
    /// Names of the stacks this one depends on.
    pub dependencies: BTreeSet<String>,
    /// Deployment options.
    pub options: DeployOptions,
}

impl StackSpec {
    /// Creates a spec with default options.
    #[must_use]
    pub fn new(name: impl Into<String>, template: StackTemplate) -> Self {
        Self {
            name: name.into(),
            template,
            dependencies: BTreeSet::new(),
            options: DeployOptions::default(),
        }
    }

    /// Adds dependencies.
    #[must_use]
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(deps.into_iter().map(Into::into));
        self
    }

    /// Replaces the options.
    #[must_use]
    pub fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_json_and_yaml() {
        let json = StackTemplate::parse("a", r#"{"Resources":{"B":{"Type":"AWS::S3::Bucket"}}}"#)
            .expect("json template");
        assert!(json.has_resources());

        let yaml = StackTemplate::parse("a", "Resources:\n  B:\n    Type: AWS::S3::Bucket\n")
            .expect("yaml template");
        assert!(yaml.has_resources());
        assert!(yaml.raw().starts_with("Resources:"));
    }

    #[test]
    fn test_rejects_non_mapping() {
        assert!(StackTemplate::parse("a", "[1, 2, 3]").is_err());
    }

    #[test]
    fn test_empty_resources() {
        let t = StackTemplate::from_value(json!({"Resources": {}}));
        assert!(!t.has_resources());
        let t = StackTemplate::from_value(json!({"Outputs": {}}));
        assert!(!t.has_resources());
    }

    #[test]
    fn test_parameter_store_detection() {
        let t = StackTemplate::from_value(json!({
            "Parameters": {
                "Version": {"Type": "AWS::SSM::Parameter::Value<String>", "Default": "/app/version"}
            },
            "Resources": {"B": {"Type": "AWS::S3::Bucket"}}
        }));
        assert!(t.uses_parameter_store());
    }

    #[test]
    fn test_change_set_name_defaults() {
        assert_eq!(DeploymentMethod::default().change_set_name(), DEFAULT_CHANGE_SET_NAME);
        let named = DeploymentMethod::ChangeSet {
            execute: false,
            change_set_name: Some(String::from("review")),
        };
        assert_eq!(named.change_set_name(), "review");
        assert!(named.is_review_only());
    }
}
