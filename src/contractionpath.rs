//! Contraction planning: turning a tensor network into an ordered list of
//! pairwise contractions.
//!
//! Plans are expressed in canonical vertex numbering: the inputs of the
//! network are numbered `1..=n` in ascending vertex-id order and every
//! intermediate receives the next free number starting at `n + 1`. This makes
//! plans independent of the actual vertex ids of the network they were
//! planned for, so cached plans apply to any structurally identical network.

use serde::{Deserialize, Serialize};

use crate::bytepacket::BytePacket;
use crate::metisgraph::MetisGraph;
use crate::tensornetwork::network::TensorNetwork;
use crate::types::TensorId;

pub mod contraction_cost;
pub mod paths;
pub mod plan_cache;

/// One pairwise contraction `result = left * right` in canonical numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractionTriple {
    /// Canonical id of the produced intermediate.
    pub result: TensorId,
    /// Canonical id of the left operand.
    pub left: TensorId,
    /// Canonical id of the right operand.
    pub right: TensorId,
}

/// A complete contraction plan with its cost estimates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractionPlan {
    /// Pairwise contractions in execution order.
    pub triples: Vec<ContractionTriple>,
    /// Largest intermediate produced while executing the plan, in elements.
    pub peak_volume: f64,
    /// Total FMA flop estimate of the plan.
    pub total_flops: f64,
}

impl ContractionPlan {
    /// Number of pairwise contractions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.triples.len()
    }

    /// Whether the plan performs no contraction (single-tensor networks).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// Serializes the plan into a byte packet.
    pub fn pack(&self, packet: &mut BytePacket) {
        packet.append_u64(self.triples.len() as u64);
        for triple in &self.triples {
            packet.append_u64(u64::from(triple.result));
            packet.append_u64(u64::from(triple.left));
            packet.append_u64(u64::from(triple.right));
        }
        packet.append_f64(self.peak_volume);
        packet.append_f64(self.total_flops);
    }

    /// Deserializes a plan from a byte packet.
    #[must_use]
    pub fn unpack(packet: &mut BytePacket) -> Option<Self> {
        let len = packet.extract_u64()? as usize;
        let mut triples = Vec::with_capacity(len);
        for _ in 0..len {
            triples.push(ContractionTriple {
                result: packet.extract_u64()? as TensorId,
                left: packet.extract_u64()? as TensorId,
                right: packet.extract_u64()? as TensorId,
            });
        }
        Some(Self {
            triples,
            peak_volume: packet.extract_f64()?,
            total_flops: packet.extract_f64()?,
        })
    }
}

/// Builds the canonical graph view of a network: vertices renumbered `1..=n`
/// in ascending vertex-id order.
#[must_use]
pub(crate) fn canonical_graph(network: &TensorNetwork) -> MetisGraph {
    let mut graph = MetisGraph::from_network(network);
    for vertex in 0..graph.num_vertices() {
        graph.set_original_id(vertex, (vertex + 1) as TensorId);
    }
    graph
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_pack_round_trip() {
        let plan = ContractionPlan {
            triples: vec![
                ContractionTriple {
                    result: 4,
                    left: 1,
                    right: 2,
                },
                ContractionTriple {
                    result: 5,
                    left: 4,
                    right: 3,
                },
            ],
            peak_volume: 64.0,
            total_flops: 4096.0,
        };
        let mut packet = BytePacket::new();
        plan.pack(&mut packet);
        let mut packet = BytePacket::from_bytes(packet.into_bytes());
        assert_eq!(ContractionPlan::unpack(&mut packet), Some(plan));
    }
}
