//! Hotswap short-circuit for development deploys.
//!
//! A hotswap compares the deployed template with the desired one and, when
//! every change is a property change on a resource type that has a
//! registered [`ResourcePatcher`], patches those resources directly instead
//! of running a stack update.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{DeployError, Result, StackweaveError};

use super::spec::StackTemplate;

/// Top-level resource keys whose changes never need a patch.
const IGNORED_RESOURCE_KEYS: [&str; 1] = ["Metadata"];

/// Patches one resource type in place.
#[async_trait]
pub trait ResourcePatcher: Send + Sync {
    /// Resource type handled by this patcher.
    fn resource_type(&self) -> &str;

    /// Whether a change to `property` can be applied in place.
    fn supports_property(&self, property: &str) -> bool;

    /// Applies the new properties of a resource.
    async fn patch(
        &self,
        stack_name: &str,
        logical_id: &str,
        properties: &serde_json::Map<String, Value>,
    ) -> Result<()>;
}

/// A resource whose properties changed.
#[derive(Debug, Clone, PartialEq)]
pub struct HotswapChange {
    /// Logical id of the resource.
    pub logical_id: String,
    /// Resource type.
    pub resource_type: String,
    /// Names of the changed properties.
    pub properties: BTreeSet<String>,
    /// Full desired property set.
    pub new_properties: serde_json::Map<String, Value>,
}

/// Result of a hotswap attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotswapOutcome {
    /// Every change was patched.
    Applied {
        /// Logical ids that were patched.
        patched: Vec<String>,
    },
    /// At least one change needs a full deployment.
    NotHotswappable {
        /// First change that blocked the hotswap.
        reason: String,
    },
}

/// Registry of patchers keyed by resource type.
#[derive(Default, Clone)]
pub struct Hotswapper {
    patchers: HashMap<String, Arc<dyn ResourcePatcher>>,
}

impl std::fmt::Debug for Hotswapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hotswapper")
            .field("resource_types", &self.patchers.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn is_intrinsic(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            map.keys().any(|k| k == "Ref" || k.starts_with("Fn::"))
                || map.values().any(is_intrinsic)
        }
        Value::Array(items) => items.iter().any(is_intrinsic),
        _ => false,
    }
}

impl Hotswapper {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a patcher for its resource type.
    #[must_use]
    pub fn with_patcher(mut self, patcher: Arc<dyn ResourcePatcher>) -> Self {
        self.patchers
            .insert(patcher.resource_type().to_string(), patcher);
        self
    }

    /// Number of registered resource types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.patchers.len()
    }

    /// Whether no patcher is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patchers.is_empty()
    }

    /// Computes the hotswappable changes between two templates.
    ///
    /// Returns `Ok(Err(reason))` when the changes need a full deployment.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::HotswapEvaluation`] when the deployed template
    /// cannot be read or a changed property needs intrinsic evaluation.
    pub fn plan(
        &self,
        stack_name: &str,
        deployed: &str,
        desired: &StackTemplate,
    ) -> Result<std::result::Result<Vec<HotswapChange>, String>> {
        let evaluation = |message: String| {
            StackweaveError::Deploy(DeployError::HotswapEvaluation {
                stack: stack_name.to_string(),
                message,
            })
        };

        let old: Value = match serde_json::from_str(deployed) {
            Ok(value) => value,
            Err(_) => serde_yaml::from_str(deployed)
                .map_err(|e| evaluation(format!("deployed template unreadable: {e}")))?,
        };
        let new = desired.parsed();

        for section in ["Parameters", "Conditions", "Mappings", "Outputs", "Transform"] {
            if old.get(section) != new.get(section) {
                return Ok(Err(format!("{section} section changed")));
            }
        }

        let empty = serde_json::Map::new();
        let old_resources = old
            .get("Resources")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let new_resources = desired.resources().unwrap_or(&empty);

        if let Some(removed) = old_resources.keys().find(|k| !new_resources.contains_key(*k)) {
            return Ok(Err(format!("resource {removed} removed")));
        }

        let mut changes = Vec::new();
        for (logical_id, new_resource) in new_resources {
            let Some(old_resource) = old_resources.get(logical_id) else {
                return Ok(Err(format!("resource {logical_id} added")));
            };
            if old_resource == new_resource {
                continue;
            }

            let resource_type = new_resource
                .get("Type")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if old_resource.get("Type").and_then(Value::as_str) != Some(resource_type) {
                return Ok(Err(format!("resource {logical_id} changed type")));
            }

            let keys: BTreeSet<&String> = old_resource
                .as_object()
                .into_iter()
                .chain(new_resource.as_object())
                .flat_map(serde_json::Map::keys)
                .collect();
            for key in keys {
                if key != "Properties"
                    && !IGNORED_RESOURCE_KEYS.contains(&key.as_str())
                    && old_resource.get(key) != new_resource.get(key)
                {
                    return Ok(Err(format!("resource {logical_id} changed {key}")));
                }
            }

            let Some(patcher) = self.patchers.get(resource_type) else {
                return Ok(Err(format!(
                    "resource {logical_id} of type {resource_type} cannot be hotswapped"
                )));
            };

            let old_props = old_resource
                .get("Properties")
                .and_then(Value::as_object)
                .unwrap_or(&empty);
            let new_props = new_resource
                .get("Properties")
                .and_then(Value::as_object)
                .unwrap_or(&empty);

            let mut changed = BTreeSet::new();
            for name in old_props.keys().chain(new_props.keys()) {
                if old_props.get(name) == new_props.get(name) {
                    continue;
                }
                if !patcher.supports_property(name) {
                    return Ok(Err(format!(
                        "property {name} of {logical_id} cannot be hotswapped"
                    )));
                }
                if new_props.get(name).is_some_and(is_intrinsic) {
                    return Err(evaluation(format!(
                        "property {name} of {logical_id} references other resources"
                    )));
                }
                changed.insert(name.clone());
            }

            if !changed.is_empty() {
                changes.push(HotswapChange {
                    logical_id: logical_id.clone(),
                    resource_type: resource_type.to_string(),
                    properties: changed,
                    new_properties: new_props.clone(),
                });
            }
        }

        if changes.is_empty() {
            return Ok(Err(String::from("no hotswappable changes")));
        }

        Ok(Ok(changes))
    }

    /// Attempts a hotswap of `desired` over the `deployed` template body.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError::HotswapEvaluation`] when the changes cannot be
    /// evaluated, or the first patch error.
    pub async fn attempt(
        &self,
        stack_name: &str,
        deployed: &str,
        desired: &StackTemplate,
    ) -> Result<HotswapOutcome> {
        let changes = match self.plan(stack_name, deployed, desired)? {
            Ok(changes) => changes,
            Err(reason) => {
                debug!("{stack_name}: not hotswappable: {reason}");
                return Ok(HotswapOutcome::NotHotswappable { reason });
            }
        };

        info!("{stack_name}: hotswapping {} resource(s)", changes.len());

        let patches = changes.iter().filter_map(|change| {
            self.patchers.get(&change.resource_type).map(|patcher| {
                patcher.patch(stack_name, &change.logical_id, &change.new_properties)
            })
        });

        for result in join_all(patches).await {
            result?;
        }

        Ok(HotswapOutcome::Applied {
            patched: changes.into_iter().map(|c| c.logical_id).collect(),
        })
    }
}
