//! Dependency graph and load-order computation.
//!
//! Nodes are plugin ids, edges point from a plugin to the plugins it depends
//! on. Ordering is Kahn's algorithm with ties broken by the order in which
//! plugins were added (discovery order). Cycles are found with Tarjan's SCC
//! pass so the error names exactly the plugins on the cycle, while every
//! plugin outside it still gets a valid position.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, HashSet},
};

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Node {
    position: u64,
    dependencies: Vec<String>,
}

/// Result of resolving the whole graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadPlan {
    /// Every plugin that can be loaded, dependencies first.
    pub order: Vec<String>,
    /// Strongly connected components, each sorted by discovery order.
    pub cycles: Vec<Vec<String>>,
    /// Plugins that depend (directly or not) on a cycle member.
    pub blocked: Vec<String>,
    /// `(plugin, missing dependency)` pairs. These do not affect ordering.
    pub missing: Vec<(String, String)>,
}

impl LoadPlan {
    pub fn cycle_containing(&self, id: &str) -> Option<&[String]> {
        self.cycles
            .iter()
            .find(|members| members.iter().any(|m| m == id))
            .map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, Node>,
    /// Reverse edges: dependency id -> plugins that declare it.
    dependents: HashMap<String, Vec<String>>,
    next_position: u64,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` with its declared dependencies. Re-adding a plugin
    /// replaces its edges but keeps its original position.
    pub fn add_plugin<I, S>(&mut self, id: impl Into<String>, dependencies: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let mut deps: Vec<String> = Vec::new();
        for dep in dependencies {
            let dep = dep.into();
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }

        let position = match self.nodes.get(&id) {
            Some(existing) => existing.position,
            None => {
                self.next_position += 1;
                self.next_position
            },
        };
        self.unlink(&id);

        for dep in &deps {
            self.dependents.entry(dep.clone()).or_default().push(id.clone());
        }
        self.nodes.insert(id, Node {
            position,
            dependencies: deps,
        });
    }

    /// Remove `id` and its outgoing edges. Plugins that still declare `id`
    /// keep their edge and will see it as missing.
    pub fn remove_plugin(&mut self, id: &str) -> bool {
        self.unlink(id);
        self.nodes.remove(id).is_some()
    }

    fn unlink(&mut self, id: &str) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };
        for dep in &node.dependencies {
            if let Some(list) = self.dependents.get_mut(dep) {
                list.retain(|d| d != id);
                if list.is_empty() {
                    self.dependents.remove(dep);
                }
            }
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.nodes
            .get(id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents
            .get(id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Everything that depends on `id`, directly or transitively, ordered
    /// so each plugin comes before the plugins it depends on. Unloading in
    /// this order never leaves a plugin without its dependencies.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut visited = HashSet::from([id.to_string()]);
        let mut out = Vec::new();
        for dependent in self.sorted(self.dependents_of(id)) {
            self.post_order(dependent, &mut visited, &mut out);
        }
        out
    }

    fn post_order<'g>(&'g self, root: &'g str, visited: &mut HashSet<String>, out: &mut Vec<String>) {
        if !visited.insert(root.to_string()) {
            return;
        }
        let mut stack = vec![(root, self.sorted(self.dependents_of(root)).into_iter())];
        while let Some((id, dependents)) = stack.last_mut() {
            let id = *id;
            let next = dependents.next();
            match next {
                Some(dependent) => {
                    if visited.insert(dependent.to_string()) {
                        stack.push((dependent, self.sorted(self.dependents_of(dependent)).into_iter()));
                    }
                },
                None => {
                    out.push(id.to_string());
                    stack.pop();
                },
            }
        }
    }

    /// Every declared dependency of `id`, transitively, excluding `id`.
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        let mut seen = HashSet::from([id.to_string()]);
        let mut stack: Vec<&str> = self.dependencies_of(id).iter().map(String::as_str).collect();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if seen.insert(next.to_string()) {
                out.push(next.to_string());
                stack.extend(self.dependencies_of(next).iter().map(String::as_str));
            }
        }
        out
    }

    fn sorted<'a>(&self, ids: &'a [String]) -> Vec<&'a str> {
        let mut ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        ids.sort_by_key(|id| self.position(id));
        ids
    }

    fn position(&self, id: &str) -> u64 {
        self.nodes.get(id).map_or(u64::MAX, |n| n.position)
    }

    fn ids_in_discovery_order(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        ids.sort_by_key(|id| self.position(id));
        ids
    }

    /// Topological order of all plugins, or the first cycle found.
    pub fn compute_load_order(&self) -> Result<Vec<String>> {
        let plan = self.resolve();
        match plan.cycles.into_iter().next() {
            Some(members) => Err(Error::DependencyCycle { members }),
            None => Ok(plan.order),
        }
    }

    /// Resolve the whole graph without failing: cycles and plugins stuck
    /// behind them are reported alongside the order of everything else.
    pub fn resolve(&self) -> LoadPlan {
        let ids = self.ids_in_discovery_order();
        let cycles = self.strongly_connected_cycles(&ids);

        let missing = ids
            .iter()
            .flat_map(|&id| {
                self.dependencies_of(id)
                    .iter()
                    .filter(move |dep| !self.contains(dep))
                    .map(move |dep| (id.to_string(), dep.clone()))
            })
            .collect();

        // Kahn over edges between registered plugins only.
        let mut in_degree: HashMap<&str, usize> = ids
            .iter()
            .map(|id| {
                let present = self
                    .dependencies_of(id)
                    .iter()
                    .filter(|dep| self.contains(dep))
                    .count();
                (*id, present)
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(u64, &str)>> = ids
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .map(|id| Reverse((self.position(id), *id)))
            .collect();

        let mut order = Vec::with_capacity(ids.len());
        while let Some(Reverse((_, id))) = ready.pop() {
            order.push(id.to_string());
            for dependent in self.dependents_of(id) {
                let Some(degree) = in_degree.get_mut(dependent.as_str()) else {
                    continue;
                };
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((self.position(dependent), dependent.as_str())));
                }
            }
        }

        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let on_cycle: HashSet<&str> = cycles.iter().flatten().map(String::as_str).collect();
        let blocked = ids
            .iter()
            .filter(|id| !placed.contains(*id) && !on_cycle.contains(*id))
            .map(|id| (*id).to_string())
            .collect();

        LoadPlan {
            order,
            cycles,
            blocked,
            missing,
        }
    }

    // ── Tarjan ──────────────────────────────────────────────────────────────

    fn strongly_connected_cycles(&self, ids: &[&str]) -> Vec<Vec<String>> {
        let mut tarjan = Tarjan::default();
        for id in ids {
            if !tarjan.index.contains_key(*id) {
                tarjan.visit(self, *id);
            }
        }

        let mut cycles: Vec<Vec<String>> = tarjan
            .components
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|id| self.dependencies_of(id).contains(id))
            })
            .map(|mut component| {
                component.sort_by_key(|id| self.position(id));
                component
            })
            .collect();
        cycles.sort_by_key(|component| component.first().map(|id| self.position(id)));
        cycles
    }
}

#[derive(Default)]
struct Tarjan {
    counter: usize,
    index: HashMap<String, usize>,
    low_link: HashMap<String, usize>,
    stack: Vec<String>,
    on_stack: HashSet<String>,
    components: Vec<Vec<String>>,
}

impl Tarjan {
    fn enter(&mut self, id: &str) {
        self.index.insert(id.to_string(), self.counter);
        self.low_link.insert(id.to_string(), self.counter);
        self.counter += 1;
        self.stack.push(id.to_string());
        self.on_stack.insert(id.to_string());
    }

    /// Iterative so long dependency chains cannot exhaust the call stack.
    fn visit<'g>(&mut self, graph: &'g DependencyGraph, root: &'g str) {
        self.enter(root);
        let mut work = vec![(root, graph.dependencies_of(root).iter())];

        while let Some((id, deps)) = work.last_mut() {
            let id = *id;
            let next = deps.next();
            match next {
                Some(dep) if !graph.contains(dep) => {},
                Some(dep) if !self.index.contains_key(dep.as_str()) => {
                    self.enter(dep);
                    work.push((dep.as_str(), graph.dependencies_of(dep).iter()));
                },
                Some(dep) => {
                    if self.on_stack.contains(dep.as_str()) {
                        let low = self.low_link[id].min(self.index[dep.as_str()]);
                        self.low_link.insert(id.to_string(), low);
                    }
                },
                None => {
                    work.pop();
                    if let Some((parent, _)) = work.last() {
                        let low = self.low_link[*parent].min(self.low_link[id]);
                        self.low_link.insert(parent.to_string(), low);
                    }
                    if self.low_link[id] == self.index[id] {
                        self.pop_component(id);
                    }
                },
            }
        }
    }

    fn pop_component(&mut self, root: &str) {
        let mut component = Vec::new();
        while let Some(member) = self.stack.pop() {
            self.on_stack.remove(&member);
            let done = member == root;
            component.push(member);
            if done {
                break;
            }
        }
        self.components.push(component);
    }
}
