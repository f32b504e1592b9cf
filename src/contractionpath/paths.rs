//! Contraction path finders.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};

use crate::contractionpath::{canonical_graph, ContractionPlan};
use crate::error::TneError;
use crate::metisgraph::MetisGraph;
use crate::tensornetwork::network::TensorNetwork;
use crate::types::TensorId;

pub mod dummy;
pub mod greedy;
pub mod metispart;

/// An optimizer for finding a contraction path.
pub trait FindPath {
    /// Finds a contraction path.
    fn find_path(&mut self) -> Result<(), TneError>;

    /// Returns the best found contraction plan in canonical numbering.
    fn best_plan(&self) -> &ContractionPlan;
}

/// The selectable planning algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PlannerKind {
    /// Left-to-right folding with smallest-intermediate tie-breaks.
    Dummy,
    /// Greedy with backtracking over the top candidates on memory violations.
    #[default]
    Heuro,
    /// Greedy without backtracking.
    Greed,
    /// Recursive METIS bipartitioning, parts solved by the heuristic planner.
    Metis,
}

impl PlannerKind {
    /// Parses a planner name as accepted by the client API.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "dummy" => Some(PlannerKind::Dummy),
            "heuro" => Some(PlannerKind::Heuro),
            "greed" => Some(PlannerKind::Greed),
            "metis" => Some(PlannerKind::Metis),
            _ => None,
        }
    }
}

/// Tuning knobs of the planners.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerConfig {
    /// Peak-memory ceiling in `log2` elements; `None` lifts the ceiling.
    pub memory_ceiling_log2: Option<f64>,
    /// Number of top candidates explored per step when backtracking.
    pub backtrack_width: usize,
    /// Total number of search steps before backtracking gives up.
    pub backtrack_budget: usize,
    /// Networks at most this large are planned directly by the heuristic
    /// planner instead of recursive partitioning.
    pub metis_threshold: usize,
    /// Imbalance tolerance handed to the graph partitioner (>= 1.0).
    pub imbalance: f64,
    /// FMA factor of the element type (2.0 real, 8.0 complex).
    pub op_factor: f64,
    /// Seed making randomized choices reproducible.
    pub seed: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_log2: None,
            backtrack_width: 8,
            backtrack_budget: 4096,
            metis_threshold: 8,
            imbalance: 1.3,
            op_factor: 8.0,
            seed: 0,
        }
    }
}

/// A pair of alive plan operands with its contraction cost, ordered by
/// `(memory delta, flops, (left, right))`. Smaller keys are better: the
/// candidate freeing the most memory wins, then the cheaper one, then the
/// lexicographically smaller id pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub diff_volume: f64,
    pub flops_log2: f64,
    pub volume_log2: f64,
    pub left_id: TensorId,
    pub right_id: TensorId,
    pub vertex1: usize,
    pub vertex2: usize,
}

/// Enumerates all candidate pairs of the graph, sorted best-first. Connected
/// pairs are preferred; outer products are only offered once no edges remain.
pub(crate) fn sorted_candidates(graph: &MetisGraph) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    for vertex1 in 0..graph.num_vertices() {
        for (vertex2, _) in graph.edges_of(vertex1) {
            if vertex2 > vertex1 {
                candidates.push(make_candidate(graph, vertex1, vertex2));
            }
        }
    }
    if candidates.is_empty() && graph.num_vertices() > 1 {
        for vertex1 in 0..graph.num_vertices() {
            for vertex2 in vertex1 + 1..graph.num_vertices() {
                candidates.push(make_candidate(graph, vertex1, vertex2));
            }
        }
    }
    candidates.sort_by_key(|c| {
        (
            OrderedFloat(c.diff_volume),
            OrderedFloat(c.flops_log2),
            c.left_id,
            c.right_id,
        )
    });
    candidates
}

pub(crate) fn make_candidate(graph: &MetisGraph, vertex1: usize, vertex2: usize) -> Candidate {
    let cost = graph.contraction_cost(vertex1, vertex2);
    let id1 = graph.original_id(vertex1);
    let id2 = graph.original_id(vertex2);
    Candidate {
        diff_volume: cost.diff_volume,
        flops_log2: cost.flops_log2,
        volume_log2: cost.volume_log2,
        left_id: id1.min(id2),
        right_id: id1.max(id2),
        vertex1,
        vertex2,
    }
}

/// Applies a candidate to the graph, assigning the next canonical id to the
/// merged vertex.
pub(crate) fn apply_candidate(
    graph: &mut MetisGraph,
    candidate: &Candidate,
    next_id: &mut TensorId,
) {
    let merged = candidate.vertex1.min(candidate.vertex2);
    graph.merge_vertices(candidate.vertex1, candidate.vertex2);
    graph.set_original_id(merged, *next_id);
    *next_id += 1;
}

/// Plans the contraction of a finalized network with the selected algorithm.
/// Returns the plan in canonical numbering (inputs `1..=n`, intermediates
/// from `n + 1`). Single-tensor networks yield an empty plan.
pub fn plan_network(
    network: &TensorNetwork,
    kind: PlannerKind,
    config: &PlannerConfig,
) -> Result<ContractionPlan, TneError> {
    assert!(network.is_finalized(), "planning requires a finalized network");
    let graph = canonical_graph(network);
    if graph.num_vertices() <= 1 {
        return Ok(ContractionPlan::default());
    }
    match kind {
        PlannerKind::Dummy => {
            let mut planner = dummy::Dummy::new(&graph, config);
            planner.find_path()?;
            Ok(planner.best_plan().clone())
        }
        PlannerKind::Heuro => {
            let mut planner = greedy::Greedy::new(&graph, config, true);
            planner.find_path()?;
            Ok(planner.best_plan().clone())
        }
        PlannerKind::Greed => {
            let mut planner = greedy::Greedy::new(&graph, config, false);
            planner.find_path()?;
            Ok(planner.best_plan().clone())
        }
        PlannerKind::Metis => {
            let mut planner = metispart::MetisPlanner::new(&graph, config);
            planner.find_path()?;
            Ok(planner.best_plan().clone())
        }
    }
}
