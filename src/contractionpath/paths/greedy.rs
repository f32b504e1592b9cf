//! Greedy planners: memory-reduction-first candidate selection, with or
//! without backtracking over the top candidates under a memory ceiling.

use crate::contractionpath::contraction_cost::finalize_plan;
use crate::contractionpath::paths::{
    apply_candidate, sorted_candidates, FindPath, PlannerConfig,
};
use crate::contractionpath::{ContractionPlan, ContractionTriple};
use crate::error::TneError;
use crate::metisgraph::MetisGraph;
use crate::types::TensorId;

/// Greedy contraction planner. With `backtrack` enabled (the `heuro`
/// algorithm) a memory-ceiling violation at any later step retries the
/// alternatives among the top candidates of earlier steps; without it (the
/// `greed` algorithm) the first feasible candidate is committed.
pub struct Greedy<'a> {
    graph: &'a MetisGraph,
    config: &'a PlannerConfig,
    backtrack: bool,
    best_plan: ContractionPlan,
}

impl<'a> Greedy<'a> {
    pub fn new(graph: &'a MetisGraph, config: &'a PlannerConfig, backtrack: bool) -> Self {
        Self {
            graph,
            config,
            backtrack,
            best_plan: ContractionPlan::default(),
        }
    }
}

impl FindPath for Greedy<'_> {
    fn find_path(&mut self) -> Result<(), TneError> {
        let mut triples = Vec::new();
        let mut next_id = (self.graph.num_vertices() + 1) as TensorId;
        greedy_triples(
            self.graph.clone(),
            &mut next_id,
            &mut triples,
            self.config,
            self.backtrack,
        )?;
        self.best_plan = finalize_plan(self.graph, triples, self.config.op_factor)?;
        Ok(())
    }

    fn best_plan(&self) -> &ContractionPlan {
        &self.best_plan
    }
}

/// Contracts `graph` down to a single vertex, appending the chosen triples.
/// Returns the canonical id of the remaining vertex. Used directly by the
/// partitioning planner on subgraphs.
pub(crate) fn greedy_triples(
    graph: MetisGraph,
    next_id: &mut TensorId,
    triples: &mut Vec<ContractionTriple>,
    config: &PlannerConfig,
    backtrack: bool,
) -> Result<TensorId, TneError> {
    let ceiling = config.memory_ceiling_log2.unwrap_or(f64::INFINITY);
    if backtrack {
        let mut budget = config.backtrack_budget;
        let (mut found, final_id) = search(&graph, *next_id, config, ceiling, &mut budget)
            .ok_or(TneError::PlannerInfeasible {
                ceiling_log2: ceiling,
            })?;
        *next_id += found.len() as TensorId;
        triples.append(&mut found);
        Ok(final_id)
    } else {
        let mut graph = graph;
        while graph.num_vertices() > 1 {
            let candidates = sorted_candidates(&graph);
            let candidate = candidates
                .into_iter()
                .find(|c| c.volume_log2 <= ceiling)
                .ok_or(TneError::PlannerInfeasible {
                    ceiling_log2: ceiling,
                })?;
            triples.push(ContractionTriple {
                result: *next_id,
                left: candidate.left_id,
                right: candidate.right_id,
            });
            apply_candidate(&mut graph, &candidate, next_id);
        }
        Ok(graph.original_id(0))
    }
}

/// Depth-first search over the top feasible candidates of every step. The
/// first complete contraction sequence wins; infeasible branches are pruned
/// and exhausted branches backtrack. Returns the triples and the id of the
/// final vertex.
fn search(
    graph: &MetisGraph,
    next_id: TensorId,
    config: &PlannerConfig,
    ceiling: f64,
    budget: &mut usize,
) -> Option<(Vec<ContractionTriple>, TensorId)> {
    if graph.num_vertices() == 1 {
        return Some((Vec::new(), graph.original_id(0)));
    }
    let candidates = sorted_candidates(graph);
    for candidate in candidates
        .into_iter()
        .filter(|c| c.volume_log2 <= ceiling)
        .take(config.backtrack_width)
    {
        if *budget == 0 {
            return None;
        }
        *budget -= 1;
        let mut child = graph.clone();
        let merged = candidate.vertex1.min(candidate.vertex2);
        child.merge_vertices(candidate.vertex1, candidate.vertex2);
        child.set_original_id(merged, next_id);
        if let Some((rest, final_id)) = search(&child, next_id + 1, config, ceiling, budget) {
            let mut triples = Vec::with_capacity(rest.len() + 1);
            triples.push(ContractionTriple {
                result: next_id,
                left: candidate.left_id,
                right: candidate.right_id,
            });
            triples.extend(rest);
            return Some((triples, final_id));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::contractionpath::canonical_graph;
    use crate::tensornetwork::network::TensorNetwork;
    use crate::tensornetwork::tensor::Tensor;

    fn chain_resolver(name: &str) -> Option<Tensor> {
        match name {
            "A" => Some(Tensor::new("A", vec![4, 8])),
            "B" => Some(Tensor::new("B", vec![8, 16])),
            "C" => Some(Tensor::new("C", vec![16, 2])),
            _ => None,
        }
    }

    #[test]
    fn test_greedy_prefers_memory_reduction() {
        let network =
            TensorNetwork::from_symbolic("D(a,c)=A(a,i)*B(i,j)*C(j,c)", chain_resolver).unwrap();
        let graph = canonical_graph(&network);
        let config = PlannerConfig::default();
        let mut planner = Greedy::new(&graph, &config, false);
        planner.find_path().unwrap();
        let plan = planner.best_plan();
        // Contracting B*C (diff 16 - 128 - 32) frees more than A*B
        // (diff 64 - 32 - 128), so B*C goes first.
        assert_eq!(
            plan.triples,
            vec![
                ContractionTriple { result: 4, left: 2, right: 3 },
                ContractionTriple { result: 5, left: 1, right: 4 },
            ]
        );
        assert_eq!(plan.peak_volume, 16.0);
    }

    #[test]
    fn test_backtracking_finds_feasible_plan() {
        // Star network: the hub contracted last keeps intermediates small.
        let resolver = |name: &str| match name {
            "H" => Some(Tensor::new("H", vec![2, 2, 2])),
            "P" => Some(Tensor::new("P", vec![2, 32])),
            "Q" => Some(Tensor::new("Q", vec![2, 32])),
            "R" => Some(Tensor::new("R", vec![2, 32])),
            _ => None,
        };
        let network = TensorNetwork::from_symbolic(
            "D(x,y,z)=H(i,j,k)*P(i,x)*Q(j,y)*R(k,z)",
            resolver,
        )
        .unwrap();
        let graph = canonical_graph(&network);
        // The final result has 32^3 elements; forbid anything bigger.
        let config = PlannerConfig {
            memory_ceiling_log2: Some(15.0),
            ..PlannerConfig::default()
        };
        let mut planner = Greedy::new(&graph, &config, true);
        planner.find_path().unwrap();
        let plan = planner.best_plan();
        assert_eq!(plan.len(), 3);
        assert!(plan.peak_volume.log2() <= 15.0);
    }

    #[test]
    fn test_greed_reports_infeasible() {
        let network =
            TensorNetwork::from_symbolic("D(a,c)=A(a,i)*B(i,j)*C(j,c)", chain_resolver).unwrap();
        let graph = canonical_graph(&network);
        let config = PlannerConfig {
            memory_ceiling_log2: Some(2.0),
            ..PlannerConfig::default()
        };
        let mut planner = Greedy::new(&graph, &config, false);
        assert!(matches!(
            planner.find_path(),
            Err(TneError::PlannerInfeasible { .. })
        ));
    }
}
