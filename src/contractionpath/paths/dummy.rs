//! The trivial left-to-right planner.

use ordered_float::OrderedFloat;

use crate::contractionpath::contraction_cost::finalize_plan;
use crate::contractionpath::paths::{make_candidate, FindPath, PlannerConfig};
use crate::contractionpath::{ContractionPlan, ContractionTriple};
use crate::error::TneError;
use crate::metisgraph::MetisGraph;
use crate::types::TensorId;

/// Folds the network left to right: at every step the leftmost alive vertex
/// absorbs the neighbor producing the smallest intermediate; ties fall to the
/// leftmost neighbor.
pub struct Dummy<'a> {
    graph: &'a MetisGraph,
    config: &'a PlannerConfig,
    best_plan: ContractionPlan,
}

impl<'a> Dummy<'a> {
    pub fn new(graph: &'a MetisGraph, config: &'a PlannerConfig) -> Self {
        Self {
            graph,
            config,
            best_plan: ContractionPlan::default(),
        }
    }
}

impl FindPath for Dummy<'_> {
    fn find_path(&mut self) -> Result<(), TneError> {
        let mut graph = self.graph.clone();
        let mut next_id = (graph.num_vertices() + 1) as TensorId;
        let mut triples = Vec::with_capacity(graph.num_vertices().saturating_sub(1));
        while graph.num_vertices() > 1 {
            let connected: Vec<usize> = graph
                .edges_of(0)
                .map(|(adjacent, _)| adjacent)
                .filter(|&adjacent| adjacent != 0)
                .collect();
            let pool: Vec<usize> = if connected.is_empty() {
                (1..graph.num_vertices()).collect()
            } else {
                connected
            };
            let candidate = pool
                .into_iter()
                .map(|vertex| make_candidate(&graph, 0, vertex))
                .min_by_key(|c| (OrderedFloat(c.volume_log2), c.vertex2))
                .unwrap();
            triples.push(ContractionTriple {
                result: next_id,
                left: candidate.left_id,
                right: candidate.right_id,
            });
            graph.merge_vertices(candidate.vertex1, candidate.vertex2);
            graph.set_original_id(0, next_id);
            next_id += 1;
        }
        self.best_plan = finalize_plan(self.graph, triples, self.config.op_factor)?;
        Ok(())
    }

    fn best_plan(&self) -> &ContractionPlan {
        &self.best_plan
    }
}
