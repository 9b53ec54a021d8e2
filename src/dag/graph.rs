// src/dag/graph.rs

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::dag::definition::TaskDefinition;
use crate::engine::TaskName;
use crate::errors::DefinitionError;

/// DFS marking used by cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not visited yet.
    White,
    /// On the current DFS path.
    Gray,
    /// Fully explored; no cycle reachable from here.
    Black,
}

/// Immutable, validated DAG of task definitions.
///
/// Edge direction inside the petgraph graph is `dependency -> dependent`:
///
/// ```toml
/// [task.migrate]
/// after = ["db"]
/// ```
///
/// adds the edge `db -> migrate`.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    definitions: BTreeMap<TaskName, TaskDefinition>,
    graph: DiGraph<TaskName, ()>,
    index: HashMap<TaskName, NodeIndex>,
}

impl TaskGraph {
    /// Validate `definitions` and build the graph.
    ///
    /// Fails on empty or duplicate names, on dependencies that are not
    /// defined, and on cycles (including a task depending on itself).
    pub fn build(
        definitions: impl IntoIterator<Item = TaskDefinition>,
    ) -> Result<Self, DefinitionError> {
        let mut defs: BTreeMap<TaskName, TaskDefinition> = BTreeMap::new();

        for def in definitions {
            if def.name.trim().is_empty() {
                return Err(DefinitionError::EmptyName);
            }
            if defs.contains_key(&def.name) {
                return Err(DefinitionError::DuplicateName(def.name));
            }
            defs.insert(def.name.clone(), def);
        }

        for def in defs.values() {
            if let Some(missing) = def.depends_on.iter().find(|d| !defs.contains_key(*d)) {
                return Err(DefinitionError::UnknownDependency {
                    task: def.name.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        if let Some(path) = find_cycle(&defs) {
            return Err(DefinitionError::Cycle { path });
        }

        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        for name in defs.keys() {
            index.insert(name.clone(), graph.add_node(name.clone()));
        }
        for def in defs.values() {
            for dep in &def.depends_on {
                graph.add_edge(index[dep], index[&def.name], ());
            }
        }

        Ok(Self {
            definitions: defs,
            graph,
            index,
        })
    }

    /// All task names, in sorted order.
    pub fn tasks(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(|s| s.as_str())
    }

    pub fn definitions(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.definitions.values()
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.definitions.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Immediate dependencies of a task (its `depends_on`).
    pub fn dependencies_of(&self, name: &str) -> impl Iterator<Item = &str> {
        self.definitions
            .get(name)
            .into_iter()
            .flat_map(|def| def.depends_on.iter().map(|s| s.as_str()))
    }

    /// Immediate dependents of a task (tasks that list it in `depends_on`),
    /// sorted by name.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let Some(&idx) = self.index.get(name) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].as_str())
            .collect();
        out.sort_unstable();
        out
    }

    /// The requested tasks plus everything they transitively depend on.
    ///
    /// Unknown names are ignored; callers validate requests beforehand.
    pub fn closure<'a>(&self, requested: impl IntoIterator<Item = &'a str>) -> BTreeSet<TaskName> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = requested.into_iter().collect();

        while let Some(name) = stack.pop() {
            if !self.contains(name) || !seen.insert(name.to_string()) {
                continue;
            }
            stack.extend(self.dependencies_of(name));
        }

        seen
    }

    /// Lazily yield sets of tasks such that every task's dependencies are in
    /// strictly earlier batches.
    ///
    /// Tasks within one batch have no ordering constraint among themselves.
    pub fn topological_batches(&self) -> TopologicalBatches<'_> {
        let mut remaining = HashMap::new();
        let mut ready = BTreeSet::new();

        for def in self.definitions.values() {
            let n = def.depends_on.len();
            if n == 0 {
                ready.insert(def.name.as_str());
            } else {
                remaining.insert(def.name.as_str(), n);
            }
        }

        TopologicalBatches {
            graph: self,
            remaining,
            ready,
        }
    }
}

/// Iterator returned by [`TaskGraph::topological_batches`].
#[derive(Debug)]
pub struct TopologicalBatches<'g> {
    graph: &'g TaskGraph,
    /// Unfinished dependency count for tasks not yet ready.
    remaining: HashMap<&'g str, usize>,
    ready: BTreeSet<&'g str>,
}

impl Iterator for TopologicalBatches<'_> {
    type Item = BTreeSet<TaskName>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            return None;
        }

        let batch = std::mem::take(&mut self.ready);
        for name in &batch {
            for dependent in self.graph.dependents_of(name) {
                if let Some(count) = self.remaining.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.remaining.remove(dependent);
                        self.ready.insert(dependent);
                    }
                }
            }
        }

        Some(batch.into_iter().map(str::to_string).collect())
    }
}

/// Three-color DFS over `depends_on` edges.
///
/// Returns the first cycle found as a path whose last element equals its
/// first.
fn find_cycle(defs: &BTreeMap<TaskName, TaskDefinition>) -> Option<Vec<TaskName>> {
    let mut colors: HashMap<&str, Color> =
        defs.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut path: Vec<&str> = Vec::new();

    for name in defs.keys() {
        if colors.get(name.as_str()) == Some(&Color::White) {
            if let Some(cycle) = visit(name, defs, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }

    None
}

fn visit<'a>(
    name: &'a str,
    defs: &'a BTreeMap<TaskName, TaskDefinition>,
    colors: &mut HashMap<&'a str, Color>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<TaskName>> {
    colors.insert(name, Color::Gray);
    path.push(name);

    if let Some(def) = defs.get(name) {
        for dep in &def.depends_on {
            match colors.get(dep.as_str()).copied().unwrap_or(Color::Black) {
                Color::White => {
                    if let Some(cycle) = visit(dep, defs, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Gray => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<TaskName> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Color::Black => {}
            }
        }
    }

    path.pop();
    colors.insert(name, Color::Black);
    None
}
