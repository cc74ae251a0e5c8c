use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Error / report types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("dependency graph is invalid: {0:?}")]
    InvalidGraph(Vec<GraphProblem>),
    #[error("unknown plugin: `{0}`")]
    UnknownPlugin(String),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

/// One structural problem found during validation. Validation reports all
/// problems at once instead of bailing on the first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GraphProblem {
    /// `plugin` declares a dependency on a name nobody registered.
    MissingDependency { plugin: String, dependency: String },
    /// `plugin` depends on itself.
    SelfDependency { plugin: String },
    /// A dependency cycle, listed in traversal order.
    Cycle { path: Vec<String> },
}

/// Validation outcome: `errors` make the graph unusable, `warnings` do not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphReport {
    pub errors: Vec<GraphProblem>,
    pub warnings: Vec<String>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

// ---------------------------------------------------------------------------
// DependencyResolver
// ---------------------------------------------------------------------------

/// Builds a DAG over registered plugin names and answers ordering queries.
///
/// Edges point from a plugin to the plugins it depends on; `dependents`
/// tracks the reverse direction. A cycle or missing dependency makes the
/// whole analysis fail fast before any plugin executes -- this is a
/// configuration error, not a runtime one.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// plugin -> its declared dependencies
    dependencies: HashMap<String, Vec<String>>,
    /// plugin -> plugins that depend on it
    dependents: HashMap<String, Vec<String>>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resolver from `(name, dependency names)` pairs.
    pub fn from_plugins<'a, I>(plugins: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut resolver = Self::new();
        for (name, deps) in plugins {
            resolver.add_plugin(name, deps.to_vec());
        }
        resolver
    }

    /// Register a plugin and its dependency list. Re-adding a name replaces
    /// its previous dependency list.
    pub fn add_plugin(&mut self, name: impl Into<String>, deps: Vec<String>) {
        let name = name.into();
        self.dependents.entry(name.clone()).or_default();
        for dep in &deps {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(name.clone());
        }
        self.dependencies.insert(name, deps);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dependencies.contains_key(name)
    }

    pub fn plugin_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Plugins that directly depend on `name`.
    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    /// Report missing dependency targets, self-dependencies, and cycles.
    /// Returns a structured report rather than erroring on first problem.
    pub fn validate(&self) -> GraphReport {
        let mut report = GraphReport::default();

        for (plugin, deps) in &self.dependencies {
            for dep in deps {
                if dep == plugin {
                    report.errors.push(GraphProblem::SelfDependency {
                        plugin: plugin.clone(),
                    });
                } else if !self.dependencies.contains_key(dep) {
                    report.errors.push(GraphProblem::MissingDependency {
                        plugin: plugin.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // DFS with an explicit recursion stack; only sound once missing
        // targets are known, so traversal skips unregistered names.
        let mut visited: HashSet<&str> = HashSet::new();
        let mut names: Vec<&String> = self.dependencies.keys().collect();
        names.sort(); // deterministic reports
        for name in names {
            if !visited.contains(name.as_str()) {
                let mut stack: Vec<&str> = Vec::new();
                let mut on_stack: HashSet<&str> = HashSet::new();
                self.find_cycle(name, &mut visited, &mut stack, &mut on_stack, &mut report);
            }
        }

        if !report.errors.is_empty() {
            debug!(errors = report.errors.len(), "dependency graph invalid");
        }
        report
    }

    fn find_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        report: &mut GraphReport,
    ) {
        visited.insert(node);
        stack.push(node);
        on_stack.insert(node);

        if let Some(deps) = self.dependencies.get(node) {
            for dep in deps {
                if dep == node || !self.dependencies.contains_key(dep) {
                    continue; // reported separately
                }
                if on_stack.contains(dep.as_str()) {
                    let start = stack.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|s| s.to_string()).collect();
                    path.push(dep.clone());
                    report.errors.push(GraphProblem::Cycle { path });
                } else if !visited.contains(dep.as_str()) {
                    self.find_cycle(dep, visited, stack, on_stack, report);
                }
            }
        }

        stack.pop();
        on_stack.remove(node);
    }

    // -----------------------------------------------------------------------
    // Ordering
    // -----------------------------------------------------------------------

    /// Topological ordering (depth-first post-order): dependencies first.
    /// Fails with the validation report if the graph is invalid.
    pub fn resolve_execution_order(&self) -> Result<Vec<String>> {
        let report = self.validate();
        if !report.is_valid() {
            return Err(ResolverError::InvalidGraph(report.errors));
        }

        let mut order = Vec::with_capacity(self.dependencies.len());
        let mut visited: HashSet<&str> = HashSet::new();
        let mut names: Vec<&String> = self.dependencies.keys().collect();
        names.sort();
        for name in names {
            self.post_order(name, &mut visited, &mut order);
        }
        Ok(order)
    }

    fn post_order<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        order: &mut Vec<String>,
    ) {
        if visited.contains(node) {
            return;
        }
        visited.insert(node);
        if let Some(deps) = self.dependencies.get(node) {
            let mut deps: Vec<&String> = deps.iter().collect();
            deps.sort();
            for dep in deps {
                self.post_order(dep, visited, order);
            }
        }
        order.push(node.to_string());
    }

    /// Partition the topological order into batches: a plugin enters a batch
    /// once every dependency is placed in an earlier batch. Batches execute
    /// in order; plugins within a batch are scheduling-independent.
    pub fn parallel_groups(&self) -> Result<Vec<Vec<String>>> {
        let order = self.resolve_execution_order()?;
        let mut batch_of: HashMap<&str, usize> = HashMap::new();
        let mut groups: Vec<Vec<String>> = Vec::new();

        for name in &order {
            let deps = &self.dependencies[name];
            let batch = deps
                .iter()
                .map(|d| batch_of[d.as_str()] + 1)
                .max()
                .unwrap_or(0);
            if batch == groups.len() {
                groups.push(Vec::new());
            }
            groups[batch].push(name.clone());
            batch_of.insert(name, batch);
        }
        Ok(groups)
    }

    /// Per-plugin depth: 0 for roots, `1 + max(dep depths)` otherwise.
    pub fn dependency_levels(&self) -> Result<HashMap<String, usize>> {
        let order = self.resolve_execution_order()?;
        let mut levels: HashMap<String, usize> = HashMap::new();
        for name in &order {
            let level = self.dependencies[name]
                .iter()
                .map(|d| levels[d] + 1)
                .max()
                .unwrap_or(0);
            levels.insert(name.clone(), level);
        }
        Ok(levels)
    }

    /// The longest dependency chain, dependencies first. Used for
    /// diagnostics and as a scheduling-priority input.
    pub fn critical_path(&self) -> Result<Vec<String>> {
        let levels = self.dependency_levels()?;
        let Some((end, _)) = levels.iter().max_by_key(|(_, l)| **l) else {
            return Ok(Vec::new());
        };

        // Walk back down through the deepest dependency at each step.
        let mut path = vec![end.clone()];
        let mut current = end.clone();
        loop {
            let deps = &self.dependencies[&current];
            match deps.iter().max_by_key(|d| levels.get(*d).copied().unwrap_or(0)) {
                Some(next) if !deps.is_empty() => {
                    path.push(next.clone());
                    current = next.clone();
                }
                _ => break,
            }
        }
        path.reverse();
        Ok(path)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
