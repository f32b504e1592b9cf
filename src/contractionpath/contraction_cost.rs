//! Cost evaluation of contraction plans by replay on the graph view.

use crate::contractionpath::{ContractionPlan, ContractionTriple};
use crate::error::TneError;
use crate::metisgraph::MetisGraph;
use crate::types::TensorId;

/// Replays `triples` on a copy of `graph` (in canonical numbering), checking
/// that every operand exists and that the replay terminates in a single
/// vertex. Returns the peak intermediate volume in elements and the total FMA
/// flop estimate, scaled by the element-type `op_factor`.
pub fn replay_plan_cost(
    graph: &MetisGraph,
    triples: &[ContractionTriple],
    op_factor: f64,
) -> Result<(f64, f64), TneError> {
    let mut graph = graph.clone();
    let mut peak_volume = 0f64;
    let mut total_flops = 0f64;
    for triple in triples {
        let left = vertex_of(&graph, triple.left);
        let right = vertex_of(&graph, triple.right);
        let cost = graph.contraction_cost(left, right);
        peak_volume = peak_volume.max(cost.volume_log2.exp2());
        total_flops += cost.flops_log2.exp2() * op_factor;
        let merged = left.min(right);
        graph.merge_vertices(left, right);
        graph.set_original_id(merged, triple.result);
    }
    assert_eq!(
        graph.num_vertices(),
        1,
        "plan replay must terminate in a single vertex"
    );
    Ok((peak_volume, total_flops))
}

/// Finalizes a list of triples into a [`ContractionPlan`] with replay-checked
/// cost estimates.
pub fn finalize_plan(
    graph: &MetisGraph,
    triples: Vec<ContractionTriple>,
    op_factor: f64,
) -> Result<ContractionPlan, TneError> {
    if triples.is_empty() {
        return Ok(ContractionPlan::default());
    }
    let (peak_volume, total_flops) = replay_plan_cost(graph, &triples, op_factor)?;
    Ok(ContractionPlan {
        triples,
        peak_volume,
        total_flops,
    })
}

fn vertex_of(graph: &MetisGraph, id: TensorId) -> usize {
    (0..graph.num_vertices())
        .find(|&v| graph.original_id(v) == id)
        .unwrap_or_else(|| panic!("operand {id} is not alive in the plan replay"))
}
