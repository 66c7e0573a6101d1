//! Parameter-block co-occurrence graph and independent-set orderings.
//!
//! Two parameter blocks are adjacent when some residual block depends on both. An
//! independent set of this graph is a set of blocks no residual touches twice, which is
//! exactly the structure a Schur-complement solver needs for its eliminated blocks:
//! eliminating them leaves a block-diagonal system.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::{
    CoreResult, ordering::ParameterBlockOrdering, parameter_block::ParameterBlockId,
    problem::Problem, program::Program,
};

/// Undirected graph over parameter blocks.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    vertices: BTreeSet<ParameterBlockId>,
    edges: HashMap<ParameterBlockId, HashSet<ParameterBlockId>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vertex(&mut self, v: ParameterBlockId) {
        if self.vertices.insert(v) {
            self.edges.insert(v, HashSet::new());
        }
    }

    /// Add an undirected edge; both endpoints must already be vertices.
    pub fn add_edge(&mut self, a: ParameterBlockId, b: ParameterBlockId) {
        if a == b || !self.vertices.contains(&a) || !self.vertices.contains(&b) {
            return;
        }
        self.edges.entry(a).or_default().insert(b);
        self.edges.entry(b).or_default().insert(a);
    }

    pub fn remove_vertex(&mut self, v: ParameterBlockId) {
        if !self.vertices.remove(&v) {
            return;
        }
        if let Some(neighbors) = self.edges.remove(&v) {
            for n in neighbors {
                if let Some(back) = self.edges.get_mut(&n) {
                    back.remove(&v);
                }
            }
        }
    }

    pub fn vertices(&self) -> &BTreeSet<ParameterBlockId> {
        &self.vertices
    }

    pub fn neighbors(&self, v: ParameterBlockId) -> impl Iterator<Item = ParameterBlockId> + '_ {
        self.edges.get(&v).into_iter().flatten().copied()
    }

    pub fn degree(&self, v: ParameterBlockId) -> usize {
        self.edges.get(&v).map_or(0, HashSet::len)
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }
}

/// Build the graph over the non-constant parameter blocks of `program`.
pub fn create_parameter_block_graph(problem: &Problem, program: &Program) -> CoreResult<Graph> {
    let mut graph = Graph::new();
    for &id in program.parameter_blocks() {
        if !problem.parameter_block(id)?.is_constant() {
            graph.add_vertex(id);
        }
    }

    for &r in program.residual_blocks() {
        let blocks = problem.residual_block(r)?.parameter_blocks();
        for (i, &a) in blocks.iter().enumerate() {
            for &b in &blocks[i + 1..] {
                graph.add_edge(a, b);
            }
        }
    }
    Ok(graph)
}

/// Greedy independent set ordering.
///
/// Vertices are visited in ascending degree (ties by handle); each unvisited vertex joins
/// the independent set and excludes its neighbors. Returns every vertex with the
/// independent set first, followed by the remaining vertices in visiting order, and the
/// size of the independent set.
pub fn independent_set_ordering(graph: &Graph) -> (Vec<ParameterBlockId>, usize) {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Grey,
        Black,
    }

    let mut order: Vec<ParameterBlockId> = graph.vertices().iter().copied().collect();
    order.sort_by_key(|&v| graph.degree(v));

    let mut color: HashMap<ParameterBlockId, Color> =
        order.iter().map(|&v| (v, Color::White)).collect();
    let mut independent_set = Vec::new();

    for &v in &order {
        if color.get(&v) != Some(&Color::White) {
            continue;
        }
        color.insert(v, Color::Black);
        independent_set.push(v);
        for n in graph.neighbors(v) {
            if let Some(c) = color.get_mut(&n)
                && *c == Color::White
            {
                *c = Color::Grey;
            }
        }
    }

    let independent_set_size = independent_set.len();
    let mut ordering = independent_set;
    ordering.extend(
        order
            .iter()
            .copied()
            .filter(|v| color.get(v) != Some(&Color::Black)),
    );
    (ordering, independent_set_size)
}

/// Whether no residual block of `program` depends on two or more members of `set`.
pub fn is_independent(
    problem: &Problem,
    program: &Program,
    set: &BTreeSet<ParameterBlockId>,
) -> CoreResult<bool> {
    for &r in program.residual_blocks() {
        let count = problem
            .residual_block(r)?
            .parameter_blocks()
            .iter()
            .filter(|id| set.contains(id))
            .count();
        if count > 1 {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Peel independent sets off the graph until it is empty, one group per set.
///
/// Group 0 is the first (largest greedy) set. Callers that want the last-peeled blocks
/// optimized first reverse the result.
pub fn recursive_independent_set_ordering(
    problem: &Problem,
    program: &Program,
) -> CoreResult<ParameterBlockOrdering> {
    let mut graph = create_parameter_block_graph(problem, program)?;
    let mut ordering = ParameterBlockOrdering::new();
    let mut group = 0;
    while graph.num_vertices() > 0 {
        let (vertices, independent_set_size) = independent_set_ordering(&graph);
        for &v in &vertices[..independent_set_size] {
            ordering.add_element_to_group(v, group);
            graph.remove_vertex(v);
        }
        group += 1;
    }
    Ok(ordering)
}
