//! Build dependency graph.
//!
//! Vertices are build nodes (targets and aliases), edges point from a
//! dependency to its dependent. The graph is checked for cycles once, when it
//! is constructed, before anything runs.

pub mod types;
pub mod walker;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::model::{BuildNode, Target, TargetLabel};

pub use types::{GraphError, WalkError};
pub use walker::{CacheResult, Completion, CompletionMap, WalkOutcome, Walker};

/// Vertex colors for cycle detection.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
  Unvisited,
  Visiting,
  Visited,
}

#[derive(Debug, Default)]
pub struct Graph {
  graph: DiGraph<Arc<BuildNode>, ()>,
  nodes: HashMap<TargetLabel, NodeIndex>,
}

impl Graph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Build a graph from resolved nodes, wiring each node's declared
  /// dependencies.
  ///
  /// # Errors
  ///
  /// Returns `DuplicateLabel` if two nodes share a label, `UnknownDependency`
  /// if a dependency is not among the nodes, and `CycleDetected` if the
  /// dependencies form a cycle.
  pub fn from_nodes(nodes: impl IntoIterator<Item = BuildNode>) -> Result<Self, GraphError> {
    let mut graph = Self::new();
    let mut pending = Vec::new();

    for node in nodes {
      if graph.contains(node.label()) {
        return Err(GraphError::DuplicateLabel(node.label().clone()));
      }
      pending.push((node.label().clone(), node.deps()));
      graph.add_vertex(node);
    }

    for (label, deps) in pending {
      for dep in deps {
        if !graph.contains(&dep) {
          return Err(GraphError::UnknownDependency {
            target: label.clone(),
            dependency: dep,
          });
        }
        graph.add_edge(&dep, &label)?;
      }
    }

    if let Some(cycle) = graph.find_cycle() {
      return Err(GraphError::CycleDetected(cycle));
    }

    Ok(graph)
  }

  /// Add a vertex. A vertex whose label is already present is left untouched.
  pub fn add_vertex(&mut self, node: BuildNode) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(node.label()) {
      return idx;
    }
    let label = node.label().clone();
    let idx = self.graph.add_node(Arc::new(node));
    self.nodes.insert(label, idx);
    idx
  }

  /// Add an edge from `dependency` to `dependent`.
  pub fn add_edge(&mut self, dependency: &TargetLabel, dependent: &TargetLabel) -> Result<(), GraphError> {
    if dependency == dependent {
      return Err(GraphError::SelfLoop(dependency.clone()));
    }
    let from = self.index(dependency)?;
    let to = self.index(dependent)?;
    self.graph.update_edge(from, to, ());
    Ok(())
  }

  fn index(&self, label: &TargetLabel) -> Result<NodeIndex, GraphError> {
    self
      .nodes
      .get(label)
      .copied()
      .ok_or_else(|| GraphError::UnknownVertex(label.clone()))
  }

  pub fn contains(&self, label: &TargetLabel) -> bool {
    self.nodes.contains_key(label)
  }

  pub fn get_vertex(&self, label: &TargetLabel) -> Option<&Arc<BuildNode>> {
    self.nodes.get(label).map(|&idx| &self.graph[idx])
  }

  /// The target behind `label`, if the vertex is a target.
  pub fn get_target(&self, label: &TargetLabel) -> Option<&Target> {
    self.get_vertex(label).and_then(|node| node.as_target())
  }

  /// All vertices, in insertion order.
  pub fn vertices(&self) -> impl Iterator<Item = &Arc<BuildNode>> {
    self.graph.node_indices().map(move |idx| &self.graph[idx])
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  /// Direct dependencies of `label`.
  pub fn get_dependencies(&self, label: &TargetLabel) -> Vec<TargetLabel> {
    self.neighbors(label, Direction::Incoming)
  }

  /// Direct dependents of `label`.
  pub fn get_dependents(&self, label: &TargetLabel) -> Vec<TargetLabel> {
    self.neighbors(label, Direction::Outgoing)
  }

  fn neighbors(&self, label: &TargetLabel, direction: Direction) -> Vec<TargetLabel> {
    let Some(&idx) = self.nodes.get(label) else {
      return Vec::new();
    };
    let mut labels: Vec<TargetLabel> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].label().clone())
      .collect();
    labels.sort();
    labels
  }

  /// Transitive dependencies of `label`, excluding itself.
  pub fn get_ancestors(&self, label: &TargetLabel) -> BTreeSet<TargetLabel> {
    let Some(&start) = self.nodes.get(label) else {
      return BTreeSet::new();
    };
    let reversed = Reversed(&self.graph);
    let mut dfs = Dfs::new(reversed, start);
    let mut out = BTreeSet::new();
    while let Some(idx) = dfs.next(reversed) {
      if idx != start {
        out.insert(self.graph[idx].label().clone());
      }
    }
    out
  }

  /// Transitive dependents of `label`, excluding itself.
  pub fn get_descendants(&self, label: &TargetLabel) -> BTreeSet<TargetLabel> {
    let Some(&start) = self.nodes.get(label) else {
      return BTreeSet::new();
    };
    let mut dfs = Dfs::new(&self.graph, start);
    let mut out = BTreeSet::new();
    while let Some(idx) = dfs.next(&self.graph) {
      if idx != start {
        out.insert(self.graph[idx].label().clone());
      }
    }
    out
  }

  /// Labels of vertices without dependencies.
  pub fn roots(&self) -> Vec<TargetLabel> {
    self
      .graph
      .node_indices()
      .filter(|&idx| self.graph.neighbors_directed(idx, Direction::Incoming).next().is_none())
      .map(|idx| self.graph[idx].label().clone())
      .collect()
  }

  pub fn has_cycle(&self) -> bool {
    self.find_cycle().is_some()
  }

  /// Three-color depth-first search. Returns the first cycle found, as the
  /// path of labels from the re-entered vertex back to itself.
  pub fn find_cycle(&self) -> Option<Vec<TargetLabel>> {
    let mut colors = vec![Color::Unvisited; self.graph.node_count()];
    let mut path = Vec::new();

    for start in self.graph.node_indices() {
      if colors[start.index()] == Color::Unvisited
        && let Some(cycle) = self.visit(start, &mut colors, &mut path)
      {
        return Some(cycle);
      }
    }
    None
  }

  fn visit(&self, idx: NodeIndex, colors: &mut [Color], path: &mut Vec<NodeIndex>) -> Option<Vec<TargetLabel>> {
    colors[idx.index()] = Color::Visiting;
    path.push(idx);

    for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
      match colors[next.index()] {
        Color::Visiting => {
          let start = path.iter().position(|&p| p == next).unwrap_or(0);
          let mut cycle: Vec<TargetLabel> = path[start..].iter().map(|&p| self.graph[p].label().clone()).collect();
          cycle.push(self.graph[next].label().clone());
          return Some(cycle);
        }
        Color::Unvisited => {
          if let Some(cycle) = self.visit(next, colors, path) {
            return Some(cycle);
          }
        }
        Color::Visited => {}
      }
    }

    path.pop();
    colors[idx.index()] = Color::Visited;
    None
  }
}
