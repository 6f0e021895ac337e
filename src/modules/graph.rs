//! Dependency resolution for modules.
//!
//! Modules form a directed graph whose edges point from a module to the
//! modules it depends on. Resolution:
//!
//! 1. rejects modules whose required dependencies are absent;
//! 2. finds strongly connected components (Tarjan) and rejects every module
//!    on a cycle, naming the cycle path;
//! 3. rejects modules that transitively require a rejected module;
//! 4. orders the rest with Kahn's algorithm, breaking ties by the
//!    manifest's `load_order` and then by name.
//!
//! Only the affected subset is rejected; everything else still gets an order.
//! Present optional dependencies are ordered like required ones; an optional
//! dependency that is absent or rejected is reported and otherwise ignored.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};

use crate::error::ModuleError;
use crate::modules::manifest::ModuleManifest;

/// Outcome of dependency resolution.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Start order: every module appears after all of its dependencies.
    pub order: Vec<String>,
    /// Rejected modules, sorted by name.
    pub failed: Vec<(String, ModuleError)>,
    /// `(module, dependency)` pairs for optional dependencies that will be absent.
    pub absent_optional: Vec<(String, String)>,
}

impl Resolution {
    /// Returns the rejection reason for a module, if any.
    #[must_use]
    pub fn failure(&self, module: &str) -> Option<&ModuleError> {
        self.failed
            .iter()
            .find(|(name, _)| name == module)
            .map(|(_, e)| e)
    }
}

/// Dependency graph over a set of candidate manifests.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    /// Candidates, sorted by name.
    nodes: Vec<&'a ModuleManifest>,
    index: HashMap<&'a str, usize>,
    /// `edges[i]` = indices of the candidates node `i` depends on, sorted.
    edges: Vec<Vec<usize>>,
    duplicates: Vec<String>,
}

impl<'a> DependencyGraph<'a> {
    /// Builds the graph. When two manifests share a name the first one wins
    /// and the name is reported as a duplicate.
    #[must_use]
    pub fn new(manifests: impl IntoIterator<Item = &'a ModuleManifest>) -> Self {
        let mut unique: BTreeMap<&'a str, &'a ModuleManifest> = BTreeMap::new();
        let mut duplicates = Vec::new();
        for manifest in manifests {
            if unique.contains_key(manifest.name.as_str()) {
                duplicates.push(manifest.name.clone());
            } else {
                unique.insert(&manifest.name, manifest);
            }
        }

        let nodes: Vec<&ModuleManifest> = unique.into_values().collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.as_str(), i))
            .collect();

        let edges = nodes
            .iter()
            .map(|m| {
                let mut deps: Vec<usize> = m
                    .dependencies
                    .iter()
                    .chain(&m.optional_dependencies)
                    .filter_map(|d| index.get(d.as_str()).copied())
                    .collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        Self {
            nodes,
            index,
            edges,
            duplicates,
        }
    }

    /// Resolves the graph. Names in `available` (for example modules that are
    /// already running) satisfy dependencies without being part of the graph.
    #[must_use]
    pub fn resolve(&self, available: &HashSet<String>) -> Resolution {
        let mut failed: BTreeMap<usize, ModuleError> = BTreeMap::new();

        for (i, manifest) in self.nodes.iter().enumerate() {
            if let Some(dep) = manifest
                .dependencies
                .iter()
                .find(|d| !self.index.contains_key(d.as_str()) && !available.contains(*d))
            {
                failed.insert(
                    i,
                    ModuleError::MissingDependency {
                        module: manifest.name.clone(),
                        dependency: dep.clone(),
                    },
                );
            }
        }

        for component in self.strongly_connected_components() {
            let is_cycle = component.len() > 1 || self.edges[component[0]].contains(&component[0]);
            if !is_cycle {
                continue;
            }
            let cycle = self.cycle_path(&component);
            for node in component {
                failed
                    .entry(node)
                    .or_insert_with(|| ModuleError::CircularDependency {
                        cycle: cycle.clone(),
                    });
            }
        }

        self.propagate_failures(&mut failed);

        let mut absent_optional = Vec::new();
        for (i, manifest) in self.nodes.iter().enumerate() {
            if failed.contains_key(&i) {
                continue;
            }
            for dep in &manifest.optional_dependencies {
                let present = match self.index.get(dep.as_str()) {
                    Some(j) => !failed.contains_key(j),
                    None => available.contains(dep),
                };
                if !present {
                    absent_optional.push((manifest.name.clone(), dep.clone()));
                }
            }
        }

        let mut failed: Vec<(String, ModuleError)> = failed
            .into_iter()
            .map(|(i, e)| (self.nodes[i].name.clone(), e))
            .collect();
        // Only the later copies of a duplicated name are rejected; the first keeps its slot.
        let rejected: HashSet<String> = failed.iter().map(|(n, _)| n.clone()).collect();
        let rejected: HashSet<&str> = rejected.iter().map(String::as_str).collect();
        let order = self.topological_order(&rejected);
        for name in &self.duplicates {
            failed.push((
                name.clone(),
                ModuleError::Duplicate {
                    module: name.clone(),
                },
            ));
        }
        failed.sort_by(|a, b| a.0.cmp(&b.0));

        Resolution {
            order,
            failed,
            absent_optional,
        }
    }

    /// Marks every module that requires a failed module as failed, until nothing changes.
    fn propagate_failures(&self, failed: &mut BTreeMap<usize, ModuleError>) {
        loop {
            let mut newly_failed = Vec::new();
            for (i, manifest) in self.nodes.iter().enumerate() {
                if failed.contains_key(&i) {
                    continue;
                }
                let failed_dep = manifest.dependencies.iter().find(|d| {
                    self.index
                        .get(d.as_str())
                        .is_some_and(|j| failed.contains_key(j))
                });
                if let Some(dep) = failed_dep {
                    newly_failed.push((
                        i,
                        ModuleError::DependencyFailed {
                            module: manifest.name.clone(),
                            dependency: dep.clone(),
                        },
                    ));
                }
            }
            if newly_failed.is_empty() {
                return;
            }
            failed.extend(newly_failed);
        }
    }

    /// Kahn's algorithm over the non-rejected nodes.
    fn topological_order(&self, rejected: &HashSet<&str>) -> Vec<String> {
        let live: Vec<bool> = self
            .nodes
            .iter()
            .map(|m| !rejected.contains(m.name.as_str()))
            .collect();

        let mut pending: Vec<usize> = vec![0; self.nodes.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for (i, deps) in self.edges.iter().enumerate() {
            if !live[i] {
                continue;
            }
            for &d in deps.iter().filter(|&&d| live[d]) {
                pending[i] += 1;
                dependents[d].push(i);
            }
        }

        let key = |i: usize| Reverse((self.nodes[i].load_order, self.nodes[i].name.as_str(), i));
        let mut ready: BinaryHeap<_> = (0..self.nodes.len())
            .filter(|&i| live[i] && pending[i] == 0)
            .map(key)
            .collect();

        let mut order = Vec::new();
        while let Some(Reverse((_, name, i))) = ready.pop() {
            order.push(name.to_string());
            for &dependent in &dependents[i] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(key(dependent));
                }
            }
        }
        order
    }

    /// Tarjan's algorithm, iterative. Components are returned with sorted members.
    fn strongly_connected_components(&self) -> Vec<Vec<usize>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0; n];
        let mut on_stack = vec![false; n];
        let mut stack = Vec::new();
        let mut next_index = 0;
        let mut components = Vec::new();

        for root in 0..n {
            if index[root] != UNVISITED {
                continue;
            }
            // (node, position of the next edge to explore)
            let mut work: Vec<(usize, usize)> = vec![(root, 0)];
            while let Some(&(node, edge)) = work.last() {
                if index[node] == UNVISITED {
                    index[node] = next_index;
                    lowlink[node] = next_index;
                    next_index += 1;
                    stack.push(node);
                    on_stack[node] = true;
                }

                if let Some(&next) = self.edges[node].get(edge) {
                    if let Some(top) = work.last_mut() {
                        top.1 += 1;
                    }
                    if index[next] == UNVISITED {
                        work.push((next, 0));
                    } else if on_stack[next] {
                        lowlink[node] = lowlink[node].min(index[next]);
                    }
                    continue;
                }

                work.pop();
                if let Some(&(parent, _)) = work.last() {
                    lowlink[parent] = lowlink[parent].min(lowlink[node]);
                }
                if lowlink[node] == index[node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack[member] = false;
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }
        components
    }

    /// Shortest cycle through the smallest member of a cyclic component,
    /// as names with the first one repeated at the end.
    fn cycle_path(&self, component: &[usize]) -> Vec<String> {
        let members: BTreeSet<usize> = component.iter().copied().collect();
        let start = component[0];
        let mut parent: HashMap<usize, usize> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        let mut seen = HashSet::from([start]);
        let mut last = start;

        'search: while let Some(node) = queue.pop_front() {
            for &next in self.edges[node].iter().filter(|n| members.contains(n)) {
                if next == start {
                    last = node;
                    break 'search;
                }
                if seen.insert(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }

        let mut path = vec![start];
        let mut node = last;
        while node != start {
            path.push(node);
            node = parent[&node];
        }
        path.push(start);
        // Collected back-to-front: start, last, ..., first step, start.
        path.reverse();
        path.into_iter()
            .map(|i| self.nodes[i].name.clone())
            .collect()
    }
}

/// Resolves a set of manifests with no externally available modules.
#[must_use]
pub fn resolve(manifests: &[ModuleManifest]) -> Resolution {
    DependencyGraph::new(manifests).resolve(&HashSet::new())
}
