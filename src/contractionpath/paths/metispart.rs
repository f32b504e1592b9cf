//! Divide-and-conquer planner driven by recursive graph bipartitioning.

use log::debug;

use crate::contractionpath::contraction_cost::finalize_plan;
use crate::contractionpath::paths::greedy::greedy_triples;
use crate::contractionpath::paths::{FindPath, PlannerConfig};
use crate::contractionpath::{ContractionPlan, ContractionTriple};
use crate::error::TneError;
use crate::metisgraph::MetisGraph;
use crate::types::TensorId;

/// Recursively bipartitions the graph view; small parts are planned by the
/// backtracking greedy planner and the two part results are contracted last.
pub struct MetisPlanner<'a> {
    graph: &'a MetisGraph,
    config: &'a PlannerConfig,
    best_plan: ContractionPlan,
}

impl<'a> MetisPlanner<'a> {
    pub fn new(graph: &'a MetisGraph, config: &'a PlannerConfig) -> Self {
        Self {
            graph,
            config,
            best_plan: ContractionPlan::default(),
        }
    }
}

impl FindPath for MetisPlanner<'_> {
    fn find_path(&mut self) -> Result<(), TneError> {
        let mut triples = Vec::with_capacity(self.graph.num_vertices().saturating_sub(1));
        let mut next_id = (self.graph.num_vertices() + 1) as TensorId;
        plan_recursive(self.graph.clone(), &mut next_id, &mut triples, self.config)?;
        self.best_plan = finalize_plan(self.graph, triples, self.config.op_factor)?;
        Ok(())
    }

    fn best_plan(&self) -> &ContractionPlan {
        &self.best_plan
    }
}

/// Contracts `graph` to a single vertex, partitioning recursively, and
/// returns the canonical id of the surviving vertex.
fn plan_recursive(
    graph: MetisGraph,
    next_id: &mut TensorId,
    triples: &mut Vec<ContractionTriple>,
    config: &PlannerConfig,
) -> Result<TensorId, TneError> {
    let num_vertices = graph.num_vertices();
    if num_vertices == 1 {
        return Ok(graph.original_id(0));
    }
    if num_vertices <= config.metis_threshold {
        return greedy_triples(graph, next_id, triples, config, true);
    }
    let mut partitioned = graph.clone();
    let num_miniparts = (num_vertices / 2).clamp(2, 8);
    if partitioned.partition_two_level(2, num_miniparts, config.imbalance) {
        let partitioning = partitioned.partitioning().unwrap();
        let populated = (0..2).all(|part| {
            partitioning.partitions.iter().any(|&p| p == part)
        });
        if populated {
            debug!(
                vertices = num_vertices,
                edge_cut = partitioning.edge_cut;
                "bipartitioned contraction subproblem"
            );
            let left_part = partitioned.subgraph(&[0]);
            let right_part = partitioned.subgraph(&[1]);
            let left = plan_recursive(left_part, next_id, triples, config)?;
            let right = plan_recursive(right_part, next_id, triples, config)?;
            let result = *next_id;
            *next_id += 1;
            triples.push(ContractionTriple {
                result,
                left: left.min(right),
                right: left.max(right),
            });
            return Ok(result);
        }
    }
    // Degenerate partitioning: fall back to the direct heuristic.
    greedy_triples(graph, next_id, triples, config, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contractionpath::canonical_graph;
    use crate::tensornetwork::network::TensorNetwork;
    use crate::tensornetwork::tensor::Tensor;

    fn chain_network(length: usize) -> TensorNetwork {
        let resolver = |name: &str| Some(Tensor::new(name, vec![2, 2]));
        let mut text = String::from("D(a,z)=T0(a,b0)");
        for i in 1..length - 1 {
            text += &format!("*T{i}(b{},b{i})", i - 1);
        }
        text += &format!("*T{}(b{},z)", length - 1, length - 2);
        TensorNetwork::from_symbolic(&text, resolver).unwrap()
    }

    #[test]
    fn test_partitioned_plan_is_complete() {
        let network = chain_network(24);
        let graph = canonical_graph(&network);
        let config = PlannerConfig::default();
        let mut planner = MetisPlanner::new(&graph, &config);
        planner.find_path().unwrap();
        let plan = planner.best_plan();
        assert_eq!(plan.len(), 23);
        // Replaying on the network must terminate in the output shape.
        let mut replay = network.clone();
        for triple in &plan.triples {
            replay
                .merge(triple.left, triple.right, triple.result)
                .unwrap();
        }
        assert_eq!(replay.num_input_tensors(), 1);
    }

    #[test]
    fn test_small_graph_skips_partitioning() {
        let network = chain_network(4);
        let graph = canonical_graph(&network);
        let config = PlannerConfig::default();
        let mut planner = MetisPlanner::new(&graph, &config);
        planner.find_path().unwrap();
        assert_eq!(planner.best_plan().len(), 3);
    }
}
