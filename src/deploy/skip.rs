//! Skip-deploy analysis.
//!
//! Decides, without any remote call, whether a deployment can be skipped
//! because the deployed stack already matches the desired one.

use serde::Serialize;
use std::fmt;
use tracing::debug;

use crate::cloud::StackDescription;

use super::spec::StackSpec;

/// The deployed side of the comparison.
#[derive(Debug, Clone, Copy)]
pub struct CurrentStack<'a> {
    /// Described remote stack.
    pub description: &'a StackDescription,
    /// Deployed template body.
    pub template: &'a str,
}

/// Why a deployment has to happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeployReason {
    /// The caller forced the deployment.
    Forced,
    /// The change set is only prepared for review.
    ReviewOnly,
    /// The stack does not exist yet.
    NewStack,
    /// The stack is in the middle of another operation.
    StackBusy {
        /// Current status.
        status: String,
    },
    /// The template body differs.
    TemplateChanged,
    /// Tags differ.
    TagsChanged,
    /// Termination protection differs.
    TerminationProtectionChanged,
    /// A parameter value differs.
    ParametersChanged {
        /// First differing parameter.
        parameter: String,
    },
    /// Parameters are resolved from the parameter store and may have changed.
    ParameterStoreValues,
    /// The last operation on the stack failed.
    FailedStatus {
        /// Current status.
        status: String,
    },
}

impl fmt::Display for DeployReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forced => write!(f, "forced deployment"),
            Self::ReviewOnly => write!(f, "change set prepared for review"),
            Self::NewStack => write!(f, "stack does not exist yet"),
            Self::StackBusy { status } => write!(f, "stack is busy ({status})"),
            Self::TemplateChanged => write!(f, "template changed"),
            Self::TagsChanged => write!(f, "tags changed"),
            Self::TerminationProtectionChanged => write!(f, "termination protection changed"),
            Self::ParametersChanged { parameter } => write!(f, "parameter {parameter} changed"),
            Self::ParameterStoreValues => write!(f, "parameters resolved from parameter store"),
            Self::FailedStatus { status } => write!(f, "stack is in failure state ({status})"),
        }
    }
}

/// Outcome of the skip analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum DeployDecision {
    /// Nothing to do.
    Skip,
    /// A deployment is required.
    Deploy(DeployReason),
}

impl DeployDecision {
    /// Whether the deployment can be skipped.
    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// Pure skip-deploy analyzer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipDeployAnalyzer;

impl SkipDeployAnalyzer {
    /// Creates a new analyzer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Evaluates whether `desired` has to be deployed over `current`.
    ///
    /// Checks run in a fixed order and the first one that requires a
    /// deployment wins.
    #[must_use]
    pub fn evaluate(&self, desired: &StackSpec, current: Option<CurrentStack<'_>>) -> DeployDecision {
        let decision = Self::decide(desired, current);
        debug!("{}: skip analysis -> {decision:?}", desired.name);
        decision
    }

    /// Shorthand for `evaluate(..).is_skip()`.
    #[must_use]
    pub fn can_skip(&self, desired: &StackSpec, current: Option<CurrentStack<'_>>) -> bool {
        self.evaluate(desired, current).is_skip()
    }

    fn decide(desired: &StackSpec, current: Option<CurrentStack<'_>>) -> DeployDecision {
        let options = &desired.options;

        if options.force {
            return DeployDecision::Deploy(DeployReason::Forced);
        }

        if options.method.is_review_only() {
            return DeployDecision::Deploy(DeployReason::ReviewOnly);
        }

        let Some(current) = current else {
            return DeployDecision::Deploy(DeployReason::NewStack);
        };
        let description = current.description;

        if description.status.is_in_progress() {
            return DeployDecision::Deploy(DeployReason::StackBusy {
                status: description.status.to_string(),
            });
        }

        if desired.template.raw() != current.template {
            return DeployDecision::Deploy(DeployReason::TemplateChanged);
        }

        if options.tags != description.tags {
            return DeployDecision::Deploy(DeployReason::TagsChanged);
        }

        if options.termination_protection != description.termination_protection {
            return DeployDecision::Deploy(DeployReason::TerminationProtectionChanged);
        }

        if let Some((key, _)) = options
            .parameters
            .iter()
            .find(|(k, v)| description.parameters.get(*k) != Some(*v))
        {
            return DeployDecision::Deploy(DeployReason::ParametersChanged {
                parameter: key.clone(),
            });
        }

        if desired.template.uses_parameter_store() {
            return DeployDecision::Deploy(DeployReason::ParameterStoreValues);
        }

        if description.status.is_failure() {
            return DeployDecision::Deploy(DeployReason::FailedStatus {
                status: description.status.to_string(),
            });
        }

        DeployDecision::Skip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::RemoteStackStatus;
    use crate::deploy::spec::{DeploymentMethod, StackTemplate};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn spec() -> StackSpec {
        StackSpec::new(
            "app",
            StackTemplate::from_value(json!({"Resources": {"B": {"Type": "AWS::S3::Bucket"}}})),
        )
    }

    fn deployed(spec: &StackSpec, status: &str) -> StackDescription {
        StackDescription {
            name: spec.name.clone(),
            stack_id: String::from("id"),
            status: RemoteStackStatus::from(status),
            status_reason: None,
            outputs: Vec::new(),
            tags: spec.options.tags.clone(),
            parameters: spec.options.parameters.clone(),
            termination_protection: spec.options.termination_protection,
        }
    }

    fn evaluate(spec: &StackSpec, desc: &StackDescription, template: &str) -> DeployDecision {
        SkipDeployAnalyzer::new().evaluate(
            spec,
            Some(CurrentStack {
                description: desc,
                template,
            }),
        )
    }

    #[test]
    fn test_identical_stack_is_skipped() {
        let spec = spec();
        let desc = deployed(&spec, "UPDATE_COMPLETE");
        assert!(evaluate(&spec, &desc, spec.template.raw()).is_skip());
    }

    #[test]
    fn test_force_wins() {
        let mut spec = spec();
        spec.options.force = true;
        let desc = deployed(&spec, "UPDATE_COMPLETE");
        assert_eq!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::Forced)
        );
    }

    #[test]
    fn test_review_only_never_skips() {
        let mut spec = spec();
        spec.options.method = DeploymentMethod::ChangeSet {
            execute: false,
            change_set_name: None,
        };
        let desc = deployed(&spec, "UPDATE_COMPLETE");
        assert_eq!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::ReviewOnly)
        );
    }

    #[test]
    fn test_missing_stack_deploys() {
        assert_eq!(
            SkipDeployAnalyzer::new().evaluate(&spec(), None),
            DeployDecision::Deploy(DeployReason::NewStack)
        );
    }

    #[test]
    fn test_busy_stack_deploys() {
        let spec = spec();
        let desc = deployed(&spec, "UPDATE_IN_PROGRESS");
        assert!(matches!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::StackBusy { .. })
        ));
    }

    #[test]
    fn test_template_compared_byte_for_byte() {
        let spec = spec();
        let desc = deployed(&spec, "CREATE_COMPLETE");
        let reformatted = format!("{} ", spec.template.raw());
        assert_eq!(
            evaluate(&spec, &desc, &reformatted),
            DeployDecision::Deploy(DeployReason::TemplateChanged)
        );
    }

    #[test]
    fn test_tags_are_order_independent_but_value_sensitive() {
        let mut spec = spec();
        spec.options.tags = BTreeMap::from([
            (String::from("team"), String::from("core")),
            (String::from("env"), String::from("dev")),
        ]);
        let mut desc = deployed(&spec, "UPDATE_COMPLETE");
        assert!(evaluate(&spec, &desc, spec.template.raw()).is_skip());

        desc.tags.insert(String::from("env"), String::from("prod"));
        assert_eq!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::TagsChanged)
        );
    }

    #[test]
    fn test_termination_protection_change() {
        let mut spec = spec();
        let desc = deployed(&spec, "UPDATE_COMPLETE");
        spec.options.termination_protection = true;
        assert_eq!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::TerminationProtectionChanged)
        );
    }

    #[test]
    fn test_parameter_change() {
        let mut spec = spec();
        let desc = deployed(&spec, "UPDATE_COMPLETE");
        spec.options
            .parameters
            .insert(String::from("Size"), String::from("large"));
        assert_eq!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::ParametersChanged {
                parameter: String::from("Size")
            })
        );
    }

    #[test]
    fn test_failed_status_deploys() {
        let spec = spec();
        let desc = deployed(&spec, "UPDATE_ROLLBACK_FAILED");
        assert!(matches!(
            evaluate(&spec, &desc, spec.template.raw()),
            DeployDecision::Deploy(DeployReason::FailedStatus { .. })
        ));
    }
}
