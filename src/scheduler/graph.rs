//! Stack dependency graph.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::deploy::StackSpec;
use crate::error::{ConfigError, Result};

use super::state::Operation;

/// Dependency edges between stacks: each stack maps to the stacks it
/// depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl StackGraph {
    /// Builds and validates a graph from `(name, dependencies)` pairs.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate names, dependencies on unknown stacks
    /// and cycles.
    pub fn build<'a, I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a BTreeSet<String>)>,
    {
        let mut edges = BTreeMap::new();
        for (name, deps) in nodes {
            if edges.insert(name.to_string(), deps.clone()).is_some() {
                return Err(ConfigError::DuplicateName {
                    name: name.to_string(),
                }
                .into());
            }
        }

        for (name, deps) in &edges {
            if let Some(missing) = deps.iter().find(|d| !edges.contains_key(*d)) {
                return Err(ConfigError::UnknownDependency {
                    stack: name.clone(),
                    dependency: missing.clone(),
                }
                .into());
            }
        }

        let graph = Self { edges };
        if let Some(cycle) = graph.find_cycle() {
            return Err(ConfigError::CircularDependency {
                cycle: cycle.join(" -> "),
            }
            .into());
        }

        Ok(graph)
    }

    /// Stack names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Number of stacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no stacks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Direct dependencies of a stack.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(name)
    }

    /// The graph with every edge reversed: each stack maps to its dependents.
    #[must_use]
    pub fn reversed(&self) -> Self {
        let mut edges: BTreeMap<String, BTreeSet<String>> = self
            .edges
            .keys()
            .map(|k| (k.clone(), BTreeSet::new()))
            .collect();
        for (name, deps) in &self.edges {
            for dep in deps {
                if let Some(dependents) = edges.get_mut(dep) {
                    dependents.insert(name.clone());
                }
            }
        }
        Self { edges }
    }

    /// `roots` plus everything reachable from them along the edges.
    #[must_use]
    pub fn closure<'a, I>(&self, roots: I) -> BTreeSet<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = roots.into_iter().map(str::to_string).collect();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            if let Some(next) = self.edges.get(&name) {
                queue.extend(next.iter().filter(|n| !seen.contains(*n)).cloned());
            }
        }
        seen
    }

    /// Stacks ordered so that every stack follows its dependencies.
    ///
    /// Ties are broken by name.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: BTreeMap<&str, usize> = self
            .edges
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();
        let dependents = self.reversed();

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.edges.len());

        while let Some(name) = ready.pop_first() {
            order.push(name.to_string());
            remaining.remove(name);
            if let Some(next) = dependents.edges.get(name) {
                for dependent in next {
                    if let Some(count) = remaining.get_mut(dependent.as_str()) {
                        *count -= 1;
                        if *count == 0 {
                            ready.insert(dependent.as_str());
                        }
                    }
                }
            }
        }

        order
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            graph: &'a BTreeMap<String, BTreeSet<String>>,
            name: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(name) {
                Some(Mark::Done) => return None,
                Some(Mark::Visiting) => {
                    let start = path.iter().position(|n| *n == name).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(name.to_string());
                    return Some(cycle);
                }
                None => {}
            }

            marks.insert(name, Mark::Visiting);
            path.push(name);
            if let Some(deps) = graph.get(name) {
                for dep in deps {
                    if let Some(cycle) = visit(graph, dep, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(name, Mark::Done);
            None
        }

        let mut marks = BTreeMap::new();
        let mut path = Vec::new();
        self.edges
            .keys()
            .find_map(|name| visit(&self.edges, name, &mut marks, &mut path))
    }
}

/// Restricts `specs` to the `roots` plus the stacks the operation needs
/// alongside them: dependencies for deploy, dependents for destroy.
///
/// Dependencies on stacks left out of the selection are dropped. An empty
/// `roots` selects everything.
///
/// # Errors
///
/// Returns an error for an invalid graph or a root that is not part of it.
pub fn select_stacks(
    specs: &[StackSpec],
    roots: &[String],
    operation: Operation,
) -> Result<Vec<StackSpec>> {
    if roots.is_empty() {
        return Ok(specs.to_vec());
    }

    let graph = StackGraph::build(specs.iter().map(|s| (s.name.as_str(), &s.dependencies)))?;
    if let Some(unknown) = roots.iter().find(|r| graph.dependencies(r).is_none()) {
        return Err(ConfigError::validation(format!("Unknown stack '{unknown}'"), "--stack").into());
    }

    let roots = roots.iter().map(String::as_str);
    let selected = match operation {
        Operation::Deploy => graph.closure(roots),
        Operation::Destroy => graph.reversed().closure(roots),
    };

    Ok(specs
        .iter()
        .filter(|s| selected.contains(&s.name))
        .map(|s| {
            let mut spec = s.clone();
            spec.dependencies.retain(|d| selected.contains(d));
            spec
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::StackTemplate;
    use crate::error::StackweaveError;
    use serde_json::json;

    fn deps(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn graph(nodes: &[(&str, BTreeSet<String>)]) -> Result<StackGraph> {
        StackGraph::build(nodes.iter().map(|(n, d)| (*n, d)))
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let g = graph(&[
            ("c", deps(&["a"])),
            ("b", deps(&["a"])),
            ("a", deps(&[])),
            ("d", deps(&["b", "c"])),
        ])
        .expect("valid graph");

        assert_eq!(g.topological_order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let err = graph(&[("a", deps(&["b"])), ("b", deps(&["c"])), ("c", deps(&["a"]))])
            .expect_err("cycle");

        let StackweaveError::Config(ConfigError::CircularDependency { cycle }) = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert_eq!(cycle, "a -> b -> c -> a");
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let err = graph(&[("a", deps(&["ghost"]))]).expect_err("unknown dependency");
        assert!(matches!(
            err,
            StackweaveError::Config(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let err = graph(&[("a", deps(&[])), ("a", deps(&[]))]).expect_err("duplicate");
        assert!(matches!(
            err,
            StackweaveError::Config(ConfigError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_closures_follow_edges() {
        let g = graph(&[
            ("a", deps(&[])),
            ("b", deps(&["a"])),
            ("c", deps(&["b"])),
            ("x", deps(&[])),
        ])
        .expect("valid graph");

        assert_eq!(g.closure(["c"]), deps(&["a", "b", "c"]));
        assert_eq!(g.reversed().closure(["a"]), deps(&["a", "b", "c"]));
    }

    fn spec(name: &str, deps: &[&str]) -> StackSpec {
        StackSpec::new(name, StackTemplate::from_value(json!({"Resources": {}})))
            .depends_on(deps.iter().copied())
    }

    fn names(specs: &[StackSpec]) -> Vec<&str> {
        specs.iter().map(|s| s.name.as_str()).collect()
    }

    #[test]
    fn test_selection_follows_operation() {
        let specs = vec![
            spec("network", &[]),
            spec("db", &["network"]),
            spec("api", &["db"]),
            spec("web", &[]),
        ];
        let roots = vec![String::from("db")];

        let deploy = select_stacks(&specs, &roots, Operation::Deploy).expect("deploy selection");
        assert_eq!(names(&deploy), vec!["network", "db"]);

        let destroy = select_stacks(&specs, &roots, Operation::Destroy).expect("destroy selection");
        assert_eq!(names(&destroy), vec!["db", "api"]);
        assert!(destroy[0].dependencies.is_empty());
        assert_eq!(destroy[1].dependencies, deps(&["db"]));

        let all = select_stacks(&specs, &[], Operation::Deploy).expect("everything");
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn test_unknown_selection_is_rejected() {
        let specs = vec![spec("network", &[])];
        let err = select_stacks(&specs, &[String::from("nope")], Operation::Deploy)
            .expect_err("unknown root");
        assert!(matches!(
            err,
            StackweaveError::Config(ConfigError::ValidationError { .. })
        ));
    }
}
