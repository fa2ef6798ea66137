//! Configuration hashing for change detection.
//!
//! Template and manifest hashes are recorded in the run record so `status`
//! and `diff` can tell what changed since the last run, and the asset
//! publisher keys staged templates by content.

use sha2::{Digest, Sha256};

use super::spec::{DeployConfig, StackConfig};

/// Hasher for computing configuration hashes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// SHA-256 of a template body, hex encoded.
    #[must_use]
    pub fn hash_template(&self, body: &str) -> String {
        hex::encode(Sha256::digest(body.as_bytes()))
    }

    /// Computes a hash of the manifest's graph and deployment options.
    ///
    /// Template contents are hashed separately; this hash covers what the
    /// manifest itself says.
    #[must_use]
    pub fn hash_config(&self, config: &DeployConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.stage.as_bytes());
        if let Some(region) = &config.project.region {
            hasher.update(region.as_bytes());
        }

        // Sorted by name so reordering the manifest does not count as a change
        let mut stacks: Vec<_> = config.stacks.iter().collect();
        stacks.sort_by(|a, b| a.name.cmp(&b.name));
        for stack in stacks {
            hasher.update(self.hash_stack(stack).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single stack entry.
    #[must_use]
    pub fn hash_stack(&self, stack: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(stack.name.as_bytes());
        hasher.update(stack.template.as_bytes());

        let mut deps: Vec<_> = stack.depends_on.iter().collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        if let Some(role) = &stack.role_arn {
            hasher.update(role.as_bytes());
        }

        // BTreeMaps iterate in key order
        for (key, value) in stack.tags.iter().chain(&stack.parameters) {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }

        hasher.update([
            u8::from(stack.rollback),
            u8::from(stack.termination_protection),
            u8::from(stack.force),
        ]);
        hasher.update(stack.hotswap.to_string().as_bytes());
        hasher.update(stack.method.change_set_name().as_bytes());
        hasher.update([u8::from(stack.method.is_review_only())]);

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn config(yaml: &str) -> DeployConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("valid manifest")
    }

    const MANIFEST: &str = r"
project:
  name: shop
stacks:
  - name: network
    template: network.json
  - name: api
    template: api.json
    depends_on: [network]
";

    #[test]
    fn test_template_hash_is_sha256() {
        let hasher = ConfigHasher::new();
        assert_eq!(
            hasher.hash_template(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_ne!(hasher.hash_template("{}"), hasher.hash_template("{ }"));
    }

    #[test]
    fn test_stack_order_does_not_change_config_hash() {
        let hasher = ConfigHasher::new();
        let original = config(MANIFEST);
        let mut reordered = original.clone();
        reordered.stacks.reverse();

        assert_eq!(hasher.hash_config(&original), hasher.hash_config(&reordered));
    }

    #[test]
    fn test_option_change_changes_stack_hash() {
        let hasher = ConfigHasher::new();
        let original = config(MANIFEST);
        let mut changed = original.clone();
        changed.stacks[1].termination_protection = true;

        assert_ne!(
            hasher.hash_stack(&original.stacks[1]),
            hasher.hash_stack(&changed.stacks[1])
        );
        assert_ne!(hasher.hash_config(&original), hasher.hash_config(&changed));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let short = hasher.short_hash("abcdef1234567890abcdef1234567890");

        assert_eq!(short, "abcdef12");
    }

    #[test]
    fn test_hashes_match() {
        assert!(ConfigHasher::hashes_match("abc123", "abc123"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc124"));
        assert!(!ConfigHasher::hashes_match("abc123", "abc12"));
    }
}
