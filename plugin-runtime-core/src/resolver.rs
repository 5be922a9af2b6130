//! Dependency resolution between plugins.
//!
//! Pure graph bookkeeping: nodes are registered plugin keys, edges point from a
//! plugin to the keys it declares as dependencies. Edges may point at keys that
//! are not (yet) registered; such a hard edge only becomes an error when an
//! ordering is requested through it.

use std::collections::{BTreeMap, BTreeSet};

use crate::api::{PluginKey, PluginMetadata};
use crate::error::DependencyError;

/// Default bound on dependency chain depth
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Declared edges of one plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    /// Hard dependencies
    pub required: BTreeSet<PluginKey>,
    /// Soft dependencies, ordered first only when registered
    pub optional: BTreeSet<PluginKey>,
}

impl Dependencies {
    pub fn of(metadata: &PluginMetadata) -> Self {
        Self {
            required: metadata.dependencies().clone(),
            optional: metadata.optional_dependencies().clone(),
        }
    }

    pub fn required(keys: impl IntoIterator<Item = PluginKey>) -> Self {
        Self {
            required: keys.into_iter().collect(),
            optional: BTreeSet::new(),
        }
    }

    /// Every declared edge, hard edges first
    pub fn all(&self) -> impl Iterator<Item = &PluginKey> {
        self.required.iter().chain(self.optional.difference(&self.required))
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.required.contains(key) || self.optional.contains(key)
    }
}

/// Dependency graph with cycle detection and deterministic ordering.
#[derive(Debug, Clone)]
pub struct DependencyResolver {
    nodes: BTreeMap<PluginKey, Dependencies>,
    max_depth: usize,
}

impl Default for DependencyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl DependencyResolver {
    pub fn new(max_depth: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            max_depth,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn contains(&self, key: &PluginKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn dependencies(&self, key: &PluginKey) -> Option<&Dependencies> {
        self.nodes.get(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert or replace `key`'s edges. Leaves the graph untouched on error.
    pub fn add(&mut self, key: PluginKey, deps: Dependencies) -> Result<(), DependencyError> {
        if let Some(cycle) = self.find_cycle(&key, &deps) {
            return Err(DependencyError::CircularDependency { key, cycle });
        }
        self.nodes.insert(key, deps);
        Ok(())
    }

    /// Remove `key` and its outgoing edges. Edges other plugins declare towards
    /// it stay in place and dangle.
    pub fn remove(&mut self, key: &PluginKey) -> Option<Dependencies> {
        self.nodes.remove(key)
    }

    /// Whether giving `key` the edges `deps` would close a cycle
    pub fn would_cycle(&self, key: &PluginKey, deps: &Dependencies) -> bool {
        self.find_cycle(key, deps).is_some()
    }

    /// Registered plugins that declare `key` as a dependency
    pub fn dependents(&self, key: &PluginKey) -> BTreeSet<PluginKey> {
        self.nodes
            .iter()
            .filter(|(_, deps)| deps.contains(key))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    /// Order `keys` so that every dependency precedes its dependents.
    ///
    /// Transitive dependencies outside `keys` shape the order but are not part
    /// of the result. Ties are broken by key order, so equal inputs always
    /// produce equal outputs.
    pub fn resolution_order<'a, I>(&self, keys: I) -> Result<Vec<PluginKey>, DependencyError>
    where
        I: IntoIterator<Item = &'a PluginKey>,
    {
        let requested: BTreeSet<&PluginKey> = keys.into_iter().collect();
        let mut walk = Walk::default();
        for key in &requested {
            if !self.nodes.contains_key(*key) {
                return Err(DependencyError::UnknownPlugin((*key).clone()));
            }
            self.visit(key, &mut walk)?;
        }
        Ok(walk
            .order
            .into_iter()
            .filter(|key| requested.contains(key))
            .collect())
    }

    /// Every plugin that transitively requires `key`, in resolution order.
    ///
    /// These are the plugins left with a missing hard dependency if `key` goes.
    pub fn impact_of_removal(&self, key: &PluginKey) -> Vec<PluginKey> {
        let mut impacted = BTreeSet::new();
        let mut frontier = vec![key.clone()];
        while let Some(current) = frontier.pop() {
            for (dependent, deps) in &self.nodes {
                if deps.required.contains(&current) && impacted.insert(dependent.clone()) {
                    frontier.push(dependent.clone());
                }
            }
        }
        impacted.remove(key);
        self.resolution_order(impacted.iter())
            .unwrap_or_else(|_| impacted.into_iter().collect())
    }

    /// Post-order walk returning the longest chain of registered edges below
    /// `key`. Heights do not depend on the walk order, so the depth verdict for
    /// a node is the same whichever keys are requested.
    fn visit(&self, key: &PluginKey, walk: &mut Walk) -> Result<usize, DependencyError> {
        if let Some(height) = walk.heights.get(key) {
            return Ok(*height);
        }
        if walk.visiting.contains(key) {
            let start = walk.stack.iter().position(|k| k == key).unwrap_or(0);
            let mut cycle: Vec<PluginKey> = walk.stack.get(start..).unwrap_or_default().to_vec();
            cycle.push(key.clone());
            return Err(DependencyError::CircularDependency {
                key: key.clone(),
                cycle,
            });
        }

        walk.visiting.insert(key.clone());
        walk.stack.push(key.clone());
        let mut height = 0;
        if let Some(deps) = self.nodes.get(key) {
            for dep in deps.all() {
                if !self.nodes.contains_key(dep) {
                    if deps.required.contains(dep) {
                        return Err(DependencyError::MissingDependency {
                            key: key.clone(),
                            missing: dep.clone(),
                        });
                    }
                    continue;
                }
                height = height.max(self.visit(dep, walk)? + 1);
            }
        }
        if height > self.max_depth {
            return Err(DependencyError::DependencyDepthExceeded {
                key: key.clone(),
                max_depth: self.max_depth,
            });
        }
        walk.stack.pop();
        walk.visiting.remove(key);
        walk.heights.insert(key.clone(), height);
        walk.order.push(key.clone());
        Ok(height)
    }

    /// Path `key -> ... -> key` that `deps` would close, if any
    fn find_cycle(&self, key: &PluginKey, deps: &Dependencies) -> Option<Vec<PluginKey>> {
        let mut seen = BTreeSet::new();
        for dep in deps.all() {
            let mut path = vec![key.clone()];
            if self.path_to(dep, key, &mut path, &mut seen) {
                return Some(path);
            }
        }
        None
    }

    fn path_to(
        &self,
        current: &PluginKey,
        target: &PluginKey,
        path: &mut Vec<PluginKey>,
        seen: &mut BTreeSet<PluginKey>,
    ) -> bool {
        path.push(current.clone());
        if current == target {
            return true;
        }
        if seen.insert(current.clone()) {
            if let Some(deps) = self.nodes.get(current) {
                for next in deps.all() {
                    if self.path_to(next, target, path, seen) {
                        return true;
                    }
                }
            }
        }
        path.pop();
        false
    }
}

#[derive(Default)]
struct Walk {
    visiting: BTreeSet<PluginKey>,
    heights: BTreeMap<PluginKey, usize>,
    stack: Vec<PluginKey>,
    order: Vec<PluginKey>,
}
