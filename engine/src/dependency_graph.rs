//! FILENAME: engine/src/dependency_graph.rs
//! PURPOSE: Implements the directed graph tracking cell-to-cell references.
//! CONTEXT: This module is the heart of the recalculation engine. Nodes are
//! (sheet key, LOC) pairs spanning every sheet in the workbook; an edge runs
//! from a cell to each cell its formula references. The graph answers three
//! questions for the recompute pipeline: which cells can a mutation affect
//! (reverse reachability), which of those sit in a cycle (strongly
//! connected components), and in what order must the rest be re-evaluated
//! (topological sort).
//!
//! TERMINOLOGY:
//! - Out-edges: the cells a formula references (its inputs).
//!   If A3 = A1 + A2, then A3 has out-edges to A1 and A2.
//! - In-edges: the cells that reference a given cell (reverse lookup).
//!   If A3 = A1 + A2, then A1 and A2 each have an in-edge from A3.
//!
//! All traversals are iterative with explicit stacks: reference chains
//! thousands of cells long must not overflow the call stack.

use std::collections::{HashMap, HashSet, VecDeque};

/// A graph node: (casefolded sheet key, uppercased location text).
/// Location text is used rather than numeric coordinates so that references
/// beyond the grid bounds (which evaluate to #REF!) still occupy a node.
pub type CellId = (String, String);

/// Direction for reachability traversals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Follow out-edges: from a cell to the cells it references.
    Forward,
    /// Follow in-edges: from a cell to the cells referencing it.
    Reverse,
}

/// The dependency graph keeps both edge directions so lookups are cheap
/// either way.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// For each cell, the set of cells it directly references.
    out_edges: HashMap<CellId, HashSet<CellId>>,

    /// For each cell, the set of cells that directly reference it.
    in_edges: HashMap<CellId, HashSet<CellId>>,
}

impl DependencyGraph {
    /// Creates a new, empty dependency graph.
    pub fn new() -> Self {
        DependencyGraph {
            out_edges: HashMap::new(),
            in_edges: HashMap::new(),
        }
    }

    /// Replaces the out-edges of a cell. Passing an empty set removes the
    /// cell's edges entirely, which is how dying cells leave the graph.
    pub fn set_out_edges(&mut self, node: &CellId, refs: HashSet<CellId>) {
        // Remove the old edges first
        if let Some(old_refs) = self.out_edges.remove(node) {
            for target in old_refs {
                if let Some(parents) = self.in_edges.get_mut(&target) {
                    parents.remove(node);
                    if parents.is_empty() {
                        self.in_edges.remove(&target);
                    }
                }
            }
        }

        if !refs.is_empty() {
            for target in &refs {
                self.in_edges
                    .entry(target.clone())
                    .or_default()
                    .insert(node.clone());
            }
            self.out_edges.insert(node.clone(), refs);
        }
    }

    /// Removes a cell's out-edges. Its in-edges persist for as long as
    /// other cells keep referencing it.
    pub fn clear_out_edges(&mut self, node: &CellId) {
        self.set_out_edges(node, HashSet::new());
    }

    pub fn out_edges_of(&self, node: &CellId) -> Option<&HashSet<CellId>> {
        self.out_edges.get(node)
    }

    pub fn in_edges_of(&self, node: &CellId) -> Option<&HashSet<CellId>> {
        self.in_edges.get(node)
    }

    pub fn has_edge(&self, from: &CellId, to: &CellId) -> bool {
        self.out_edges
            .get(from)
            .map(|targets| targets.contains(to))
            .unwrap_or(false)
    }

    /// The nodes on the given sheet that at least one cell references.
    /// These are the recompute seeds when a sheet appears or disappears.
    pub fn referenced_nodes_on_sheet(&self, sheet_key: &str) -> Vec<CellId> {
        self.in_edges
            .iter()
            .filter(|(node, parents)| node.0 == sheet_key && !parents.is_empty())
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// BFS over the chosen edge direction, starting from (and including)
    /// the seed nodes. With Direction::Reverse this yields every cell that
    /// transitively depends on a seed, i.e. the recompute set.
    pub fn reachable_from<'a>(
        &self,
        seeds: impl IntoIterator<Item = &'a CellId>,
        direction: Direction,
    ) -> HashSet<CellId> {
        let edges = match direction {
            Direction::Forward => &self.out_edges,
            Direction::Reverse => &self.in_edges,
        };

        let mut reachable: HashSet<CellId> = HashSet::new();
        let mut queue: VecDeque<CellId> = VecDeque::new();
        for seed in seeds {
            if reachable.insert(seed.clone()) {
                queue.push_back(seed.clone());
            }
        }

        while let Some(current) = queue.pop_front() {
            if let Some(neighbors) = edges.get(&current) {
                for neighbor in neighbors {
                    if reachable.insert(neighbor.clone()) {
                        queue.push_back(neighbor.clone());
                    }
                }
            }
        }

        reachable
    }

    /// Strongly connected components of the subgraph induced by `nodes`,
    /// via an iterative Tarjan's algorithm. The order of `nodes` fixes all
    /// tie-breaks, so callers pass a deterministically sorted slice.
    /// A component of size > 1, or a single node with a self-loop, is a
    /// cycle.
    pub fn scc(&self, nodes: &[CellId]) -> Vec<Vec<CellId>> {
        let index_of: HashMap<&CellId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let adjacency: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                let mut targets: Vec<usize> = self
                    .out_edges
                    .get(n)
                    .map(|set| set.iter().filter_map(|t| index_of.get(t).copied()).collect())
                    .unwrap_or_default();
                targets.sort_unstable();
                targets
            })
            .collect();

        const UNVISITED: usize = usize::MAX;
        let n = nodes.len();
        let mut index = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<usize> = Vec::new();
        let mut next_index = 0usize;
        let mut components: Vec<Vec<CellId>> = Vec::new();

        for start in 0..n {
            if index[start] != UNVISITED {
                continue;
            }
            // Work stack of (node, position in its adjacency list)
            let mut work: Vec<(usize, usize)> = vec![(start, 0)];
            while let Some(&mut (v, ref mut pos)) = work.last_mut() {
                if *pos == 0 {
                    index[v] = next_index;
                    lowlink[v] = next_index;
                    next_index += 1;
                    stack.push(v);
                    on_stack[v] = true;
                }
                if *pos < adjacency[v].len() {
                    let w = adjacency[v][*pos];
                    *pos += 1;
                    if index[w] == UNVISITED {
                        work.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(index[w]);
                    }
                } else {
                    work.pop();
                    if let Some(&(parent, _)) = work.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == index[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().expect("tarjan stack underflow");
                            on_stack[w] = false;
                            component.push(nodes[w].clone());
                            if w == v {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }

        components
    }

    /// Topological sort of the subgraph induced by `nodes`, which must be
    /// acyclic (cycle members are excluded by the caller). Iterative DFS
    /// over the in-edge (dependents) direction with gray/black marking;
    /// the reversed postorder puts dependencies before dependents. The
    /// order of `nodes` fixes seed and neighbor tie-breaks.
    pub fn toposort(&self, nodes: &[CellId]) -> Vec<CellId> {
        let index_of: HashMap<&CellId, usize> =
            nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();
        let dependents: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                let mut targets: Vec<usize> = self
                    .in_edges
                    .get(n)
                    .map(|set| set.iter().filter_map(|t| index_of.get(t).copied()).collect())
                    .unwrap_or_default();
                targets.sort_unstable();
                targets
            })
            .collect();

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let n = nodes.len();
        let mut marks = vec![Mark::White; n];
        let mut postorder: Vec<usize> = Vec::with_capacity(n);

        for start in 0..n {
            if marks[start] != Mark::White {
                continue;
            }
            let mut work: Vec<(usize, usize)> = vec![(start, 0)];
            marks[start] = Mark::Gray;
            while let Some(&mut (v, ref mut pos)) = work.last_mut() {
                if *pos < dependents[v].len() {
                    let w = dependents[v][*pos];
                    *pos += 1;
                    if marks[w] == Mark::White {
                        marks[w] = Mark::Gray;
                        work.push((w, 0));
                    }
                } else {
                    marks[v] = Mark::Black;
                    postorder.push(v);
                    work.pop();
                }
            }
        }

        postorder
            .into_iter()
            .rev()
            .map(|i| nodes[i].clone())
            .collect()
    }

    /// Returns the total number of cells that have out-edges.
    pub fn formula_cell_count(&self) -> usize {
        self.out_edges.len()
    }

    /// Returns the total number of reference relationships.
    pub fn dependency_count(&self) -> usize {
        self.out_edges.values().map(|v| v.len()).sum()
    }

    /// Clears the entire dependency graph.
    pub fn clear(&mut self) {
        self.out_edges.clear();
        self.in_edges.clear();
    }
}
