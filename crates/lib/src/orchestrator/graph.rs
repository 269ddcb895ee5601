//! Dependency graph of the units selected for one build.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};
use thiserror::Error;

use crate::plan::BuildPlan;

/// Errors that make a plan impossible to schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
  /// A `depends_on` entry names a unit that is not in the plan.
  #[error("unit '{unit}' depends on '{dependency}', which is not defined in the plan")]
  MissingDependency { unit: String, dependency: String },

  /// No pending unit can start; the remaining units wait on each other.
  #[error("cannot make progress, units have cyclic dependencies: {}", units.join(", "))]
  Unsatisfiable { units: Vec<String> },
}

/// Units and their `depends_on` edges, pointing from dependency to dependent.
pub struct BuildGraph {
  graph: DiGraph<String, ()>,
  nodes: HashMap<String, NodeIndex>,
}

impl BuildGraph {
  /// Build the graph of `selected` plus everything it transitively depends on.
  pub fn from_plan(plan: &BuildPlan, selected: &[String]) -> Result<Self, SchedulingError> {
    let mut closure: BTreeSet<String> = BTreeSet::new();
    let mut worklist: Vec<String> = selected.to_vec();

    while let Some(name) = worklist.pop() {
      if !closure.insert(name.clone()) {
        continue;
      }
      let Some(unit) = plan.unit(&name) else {
        continue;
      };
      for dependency in &unit.depends_on {
        if plan.unit(dependency).is_none() {
          return Err(SchedulingError::MissingDependency {
            unit: name.clone(),
            dependency: dependency.clone(),
          });
        }
        worklist.push(dependency.clone());
      }
    }

    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();
    for name in &closure {
      nodes.insert(name.clone(), graph.add_node(name.clone()));
    }

    for name in &closure {
      let Some(unit) = plan.unit(name) else {
        continue;
      };
      let dependent = nodes[name];
      for dependency in &unit.depends_on {
        if let Some(&dep_idx) = nodes.get(dependency) {
          graph.update_edge(dep_idx, dependent, ());
        }
      }
    }

    Ok(Self { graph, nodes })
  }

  pub fn unit_count(&self) -> usize {
    self.nodes.len()
  }

  /// Every unit in the graph, sorted by name.
  pub fn units(&self) -> Vec<String> {
    let mut units: Vec<String> = self.nodes.keys().cloned().collect();
    units.sort();
    units
  }

  /// Every unit `unit` depends on, directly or through other units, sorted by name.
  pub fn transitive_dependencies(&self, unit: &str) -> Vec<String> {
    let Some(&start) = self.nodes.get(unit) else {
      return Vec::new();
    };
    let reversed = Reversed(&self.graph);
    let mut dfs = Dfs::new(reversed, start);
    let mut deps = Vec::new();
    while let Some(idx) = dfs.next(reversed) {
      if idx != start {
        deps.push(self.graph[idx].clone());
      }
    }
    deps.sort();
    deps
  }

  /// Units not yet in `done` whose dependencies are all in `done`, sorted by name.
  pub fn ready(&self, done: &HashSet<String>) -> Vec<String> {
    let mut ready: Vec<String> = self
      .graph
      .node_indices()
      .filter(|&idx| !done.contains(&self.graph[idx]))
      .filter(|&idx| {
        self
          .graph
          .neighbors_directed(idx, Direction::Incoming)
          .all(|dep| done.contains(&self.graph[dep]))
      })
      .map(|idx| self.graph[idx].clone())
      .collect();
    ready.sort();
    ready
  }

  /// The error for a state where nothing outside `done` is ready.
  pub fn stuck(&self, done: &HashSet<String>) -> SchedulingError {
    let mut units: Vec<String> = self.nodes.keys().filter(|u| !done.contains(*u)).cloned().collect();
    units.sort();
    SchedulingError::Unsatisfiable { units }
  }
}
