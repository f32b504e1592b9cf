//! Multigraph view of a tensor network for graph partitioning.
//!
//! Every input tensor becomes a graph vertex with weight `log2(open volume)
//! + 1`; every contracted leg pair becomes an edge with weight `log2(extent)
//! + 1`. The output tensor is not a graph vertex; legs to it contribute to the
//! source vertex weight. The graph is stored in CSR form (`xadj`, `adjncy`)
//! with adjacency lists kept sorted.

use metis::Graph;

use crate::bytepacket::BytePacket;
use crate::tensornetwork::network::{TensorNetwork, OUTPUT_TENSOR};
use crate::types::{DimensionId, TensorId};

type Idx = i32;

/// Contraction cost estimate for a vertex pair, in the log2 domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContractionCost {
    /// `log2` of the FMA flop count of the pairwise contraction.
    pub flops_log2: f64,
    /// `log2` of the volume of the produced intermediate.
    pub volume_log2: f64,
    /// Intermediate volume minus both input volumes, in elements.
    pub diff_volume: f64,
}

/// Result of a partitioning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Partitioning {
    /// Partition id per vertex.
    pub partitions: Vec<usize>,
    /// Sum of vertex weights per partition.
    pub part_weights: Vec<i64>,
    /// Total weight of edges crossing partitions.
    pub edge_cut: i64,
    /// Number of distinct cross-partition edges.
    pub num_cross_edges: usize,
    /// Number of partitions.
    pub num_parts: usize,
}

/// Vertex- and edge-weighted multigraph over the input tensors of a network.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetisGraph {
    num_vertices: usize,
    xadj: Vec<Idx>,
    adjncy: Vec<Idx>,
    vwgt: Vec<Idx>,
    adjwgt: Vec<Idx>,
    renumber: Vec<TensorId>,
    partitioning: Option<Partitioning>,
}

/// Truncated `log2(value) + 1` weight used for vertices and edges.
fn log_weight(value: u64) -> Idx {
    assert!(value > 0, "weights require positive extents");
    (value.max(1).ilog2() as Idx) + 1
}

impl MetisGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            xadj: vec![0],
            ..Self::default()
        }
    }

    /// Builds the graph view of a finalized tensor network. Vertex ids are
    /// assigned in ascending tensor-id order; the original tensor ids are
    /// retained in the renumbering table.
    #[must_use]
    pub fn from_network(network: &TensorNetwork) -> Self {
        let mut graph = Self::new();
        let ids: Vec<TensorId> = network.input_ids().collect();
        let index_of = |id: TensorId| ids.iter().position(|&i| i == id).unwrap();
        for &id in &ids {
            let conn = network.tensor_conn(id).unwrap();
            let mut open_volume = 1u64;
            let mut edges: Vec<(usize, u64)> = Vec::new();
            for (dim, leg) in conn.legs().iter().enumerate() {
                let extent = conn.tensor().dim_extent(dim as DimensionId);
                if leg.tensor_id() == OUTPUT_TENSOR {
                    open_volume = open_volume.saturating_mul(extent);
                } else {
                    let adjacent = index_of(leg.tensor_id());
                    // Parallel legs to the same vertex combine multiplicatively
                    // before taking the log.
                    match edges.iter_mut().find(|(v, _)| *v == adjacent) {
                        Some((_, vol)) => *vol = vol.saturating_mul(extent),
                        None => edges.push((adjacent, extent)),
                    }
                }
            }
            let weighted: Vec<(usize, Idx)> = edges
                .into_iter()
                .map(|(v, vol)| (v, log_weight(vol)))
                .collect();
            graph.append_vertex(&weighted, log_weight(open_volume));
            graph.renumber.push(id);
        }
        graph
    }

    /// Reconstructs a graph from its packed byte form.
    #[must_use]
    pub fn unpack(packet: &mut BytePacket) -> Option<Self> {
        let num_vertices = packet.extract_u64()? as usize;
        let renumber = packet
            .extract_vec()?
            .into_iter()
            .map(|v| v as TensorId)
            .collect();
        let to_idx = |values: Vec<u64>| values.into_iter().map(|v| v as Idx).collect();
        let graph = Self {
            num_vertices,
            renumber,
            xadj: to_idx(packet.extract_vec()?),
            adjncy: to_idx(packet.extract_vec()?),
            vwgt: to_idx(packet.extract_vec()?),
            adjwgt: to_idx(packet.extract_vec()?),
            partitioning: None,
        };
        graph.assert_invariants();
        Some(graph)
    }

    /// Packs the graph into the little-endian wire format: `num_vertices`,
    /// then the length-prefixed vectors `renumber`, `xadj`, `adjncy`, `vwgt`,
    /// `adjwgt`.
    pub fn pack(&self, packet: &mut BytePacket) {
        packet.append_u64(self.num_vertices as u64);
        let renumber: Vec<u64> = self.renumber.iter().map(|&v| u64::from(v)).collect();
        packet.append_slice(&renumber);
        for vector in [&self.xadj, &self.adjncy, &self.vwgt, &self.adjwgt] {
            let words: Vec<u64> = vector.iter().map(|&v| v as u64).collect();
            packet.append_slice(&words);
        }
    }

    /// Number of vertices.
    #[must_use]
    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    /// Weight of a vertex (`log2(open volume) + 1`).
    #[must_use]
    pub fn vertex_weight(&self, vertex: usize) -> Idx {
        self.vwgt[vertex]
    }

    /// Sorted `(adjacent vertex, edge weight)` pairs of one vertex.
    pub fn edges_of(&self, vertex: usize) -> impl Iterator<Item = (usize, Idx)> + '_ {
        let range = self.xadj[vertex] as usize..self.xadj[vertex + 1] as usize;
        range.map(move |e| (self.adjncy[e] as usize, self.adjwgt[e]))
    }

    /// Original tensor id of a graph vertex.
    #[must_use]
    pub fn original_id(&self, vertex: usize) -> TensorId {
        if self.renumber.is_empty() {
            vertex as TensorId
        } else {
            self.renumber[vertex]
        }
    }

    /// Overwrites the renumbering entry of a vertex (used by planners to
    /// track intermediate tensor ids through merges).
    pub fn set_original_id(&mut self, vertex: usize, id: TensorId) {
        if self.renumber.is_empty() {
            self.renumber = (0..self.num_vertices as TensorId).collect();
        }
        self.renumber[vertex] = id;
    }

    /// The last partitioning, if any.
    #[must_use]
    pub fn partitioning(&self) -> Option<&Partitioning> {
        self.partitioning.as_ref()
    }

    /// Sum of all vertex and edge weights (each edge counted twice, once per
    /// direction).
    #[must_use]
    pub fn total_weight(&self) -> i64 {
        let vertex: i64 = self.vwgt.iter().map(|&w| i64::from(w)).sum();
        let edge: i64 = self.adjwgt.iter().map(|&w| i64::from(w)).sum();
        vertex + edge
    }

    /// `log2` of the total volume of a vertex: its open volume times all
    /// incident edge volumes.
    #[must_use]
    pub fn vertex_log_volume(&self, vertex: usize) -> f64 {
        let mut log_volume = f64::from(self.vwgt[vertex] - 1);
        for (_, weight) in self.edges_of(vertex) {
            log_volume += f64::from(weight - 1);
        }
        log_volume
    }

    fn assert_invariants(&self) {
        assert_eq!(self.xadj.len(), self.num_vertices + 1);
        assert_eq!(self.adjncy.len(), self.adjwgt.len());
        assert_eq!(self.adjncy.len(), self.xadj[self.num_vertices] as usize);
        assert_eq!(self.vwgt.len(), self.num_vertices);
        for vertex in 0..self.num_vertices {
            let range = self.xadj[vertex] as usize..self.xadj[vertex + 1] as usize;
            assert!(
                self.adjncy[range].windows(2).all(|w| w[0] <= w[1]),
                "adjacency list of vertex {vertex} is not sorted"
            );
        }
    }

    /// Appends a vertex with the given `(adjacent vertex, edge weight)` pairs
    /// and vertex weight. Invalidates any partitioning.
    pub fn append_vertex(&mut self, edges: &[(usize, Idx)], vertex_weight: Idx) {
        self.partitioning = None;
        let mut edges = edges.to_vec();
        edges.sort_unstable();
        for (adjacent, weight) in edges {
            self.adjncy.push(adjacent as Idx);
            self.adjwgt.push(weight);
        }
        self.xadj.push(self.adjncy.len() as Idx);
        self.vwgt.push(vertex_weight);
        self.num_vertices += 1;
        self.assert_invariants();
    }

    /// Estimates the cost of contracting two vertices. Volumes follow the
    /// log-domain model: with total volumes `O_u`, `O_v` and shared volume
    /// `C`, the intermediate is `O_u + O_v - 2C` and the FMA flops are
    /// `O_u + O_v - C` (all log2).
    #[must_use]
    pub fn contraction_cost(&self, vertex1: usize, vertex2: usize) -> ContractionCost {
        assert!(vertex1 != vertex2, "cannot contract a vertex with itself");
        let left = self.vertex_log_volume(vertex1);
        let right = self.vertex_log_volume(vertex2);
        let mut shared = 0.0;
        for (adjacent, weight) in self.edges_of(vertex1) {
            if adjacent == vertex2 {
                shared += f64::from(weight - 1);
            }
        }
        let volume_log2 = left + right - 2.0 * shared;
        ContractionCost {
            flops_log2: left + right - shared,
            volume_log2,
            diff_volume: volume_log2.exp2() - (left.exp2() + right.exp2()),
        }
    }

    /// Merges `vertex2` into `vertex1`, exactly mirroring a network merge on
    /// weights and adjacency: contracted edges vanish, parallel edges combine
    /// additively in log space (`w1 + w2 - 1`), open volumes combine the same
    /// way on the vertex weight, and `vertex2` is deleted.
    pub fn merge_vertices(&mut self, vertex1: usize, vertex2: usize) {
        assert!(vertex1 != vertex2, "cannot merge a vertex with itself");
        assert!(vertex1 < self.num_vertices && vertex2 < self.num_vertices);
        self.partitioning = None;
        let (vertex1, vertex2) = (vertex1.min(vertex2), vertex1.max(vertex2));

        // Pull out all adjacency lists, absorb vertex2 into vertex1.
        let mut lists: Vec<Vec<(usize, Idx)>> = (0..self.num_vertices)
            .map(|v| self.edges_of(v).collect())
            .collect();
        let absorbed = lists.remove(vertex2);
        lists[vertex1].extend(absorbed);

        let remap = |v: usize| if v == vertex2 { vertex1 } else if v > vertex2 { v - 1 } else { v };

        let mut vwgt = self.vwgt.clone();
        vwgt[vertex1] += vwgt[vertex2] - 1;
        vwgt.remove(vertex2);

        let num_vertices = self.num_vertices - 1;
        let mut xadj = Vec::with_capacity(num_vertices + 1);
        let mut adjncy = Vec::new();
        let mut adjwgt = Vec::new();
        xadj.push(0);
        for (vertex, list) in lists.into_iter().enumerate() {
            let mut remapped: Vec<(usize, Idx)> = list
                .into_iter()
                .map(|(adjacent, weight)| (remap(adjacent), weight))
                .filter(|&(adjacent, _)| !(vertex == vertex1 && adjacent == vertex1))
                .collect();
            remapped.sort_unstable();
            // Combine parallel edges: weights add in log space, offset once.
            let mut combined: Vec<(usize, Idx)> = Vec::with_capacity(remapped.len());
            for (adjacent, weight) in remapped {
                match combined.last_mut() {
                    Some((last, acc)) if *last == adjacent => *acc += weight - 1,
                    _ => combined.push((adjacent, weight)),
                }
            }
            for (adjacent, weight) in combined {
                adjncy.push(adjacent as Idx);
                adjwgt.push(weight);
            }
            xadj.push(adjncy.len() as Idx);
        }
        self.num_vertices = num_vertices;
        self.xadj = xadj;
        self.adjncy = adjncy;
        self.adjwgt = adjwgt;
        self.vwgt = vwgt;
        if !self.renumber.is_empty() {
            self.renumber.remove(vertex2);
        }
        self.assert_invariants();
    }

    /// Partitions the graph into `num_parts` parts with the given imbalance
    /// tolerance (>= 1.0). Deterministic under the fixed METIS seed.
    pub fn partition(&mut self, num_parts: usize, imbalance: f64) -> bool {
        assert!(self.num_vertices > 0, "cannot partition an empty graph");
        assert!(num_parts > 0, "need at least one partition");
        assert!(imbalance >= 1.0, "imbalance tolerance must be >= 1.0");
        let num_parts = num_parts.min(self.num_vertices);
        let mut partitions = vec![0 as Idx; self.num_vertices];
        if num_parts > 1 {
            let ubvec = [imbalance as f32];
            let graph = match Graph::new(1, num_parts as Idx, &self.xadj, &self.adjncy) {
                Ok(graph) => graph
                    .set_vwgt(&self.vwgt)
                    .set_adjwgt(&self.adjwgt)
                    .set_ubvec(&ubvec)
                    .set_option(metis::option::Seed(0)),
                Err(error) => {
                    log::error!("invalid METIS graph: {error}");
                    return false;
                }
            };
            if let Err(error) = graph.part_kway(&mut partitions) {
                log::error!("METIS k-way partitioning failed: {error}");
                return false;
            }
        }
        self.store_partitioning(
            partitions.into_iter().map(|p| p as usize).collect(),
            num_parts,
        );
        true
    }

    /// Two-level partitioning: first split into `num_miniparts`, then merge
    /// the miniparts into `num_parts` macroparts by partitioning the
    /// coarsened graph.
    pub fn partition_two_level(
        &mut self,
        num_parts: usize,
        num_miniparts: usize,
        imbalance: f64,
    ) -> bool {
        assert!(num_miniparts >= num_parts, "miniparts must not be fewer than parts");
        if !self.partition(num_miniparts, imbalance) {
            return false;
        }
        let fine = self.partitioning.clone().unwrap();
        if fine.num_parts <= num_parts {
            return true;
        }
        // Coarse adjacency matrix between miniparts.
        let k = fine.num_parts;
        let mut adjacency = vec![vec![0i64; k]; k];
        for vertex in 0..self.num_vertices {
            let partition = fine.partitions[vertex];
            for (adjacent, weight) in self.edges_of(vertex) {
                let adj_partition = fine.partitions[adjacent];
                adjacency[partition][adj_partition] += i64::from(weight);
            }
        }
        let mut coarse = MetisGraph::new();
        for i in 0..k {
            let edges: Vec<(usize, Idx)> = (0..k)
                .filter(|&j| j != i && adjacency[i][j] != 0)
                .map(|j| (j, adjacency[i][j] as Idx))
                .collect();
            coarse.append_vertex(&edges, fine.part_weights[i] as Idx);
        }
        if !coarse.partition(num_parts, imbalance) {
            return false;
        }
        let coarse_parts = coarse.partitioning.unwrap();
        let partitions: Vec<usize> = fine
            .partitions
            .iter()
            .map(|&p| coarse_parts.partitions[p])
            .collect();
        self.store_partitioning(partitions, num_parts);
        true
    }

    fn store_partitioning(&mut self, partitions: Vec<usize>, num_parts: usize) {
        let mut part_weights = vec![0i64; num_parts];
        let mut edge_cut = 0i64;
        let mut num_cross_edges = 0usize;
        for vertex in 0..self.num_vertices {
            part_weights[partitions[vertex]] += i64::from(self.vwgt[vertex]);
            for (adjacent, weight) in self.edges_of(vertex) {
                if partitions[adjacent] != partitions[vertex] {
                    num_cross_edges += 1;
                    edge_cut += i64::from(weight);
                }
            }
        }
        assert!(num_cross_edges % 2 == 0, "cross edges must pair up");
        self.partitioning = Some(Partitioning {
            partitions,
            part_weights,
            edge_cut: edge_cut / 2,
            num_cross_edges: num_cross_edges / 2,
            num_parts,
        });
    }

    /// Extracts the subgraph induced by the vertices lying in the given
    /// partitions. Edges leaving the subgraph are absorbed into the vertex
    /// weights; the renumbering table maps back to original tensor ids.
    #[must_use]
    pub fn subgraph(&self, wanted: &[usize]) -> MetisGraph {
        let partitioning = self
            .partitioning
            .as_ref()
            .expect("subgraph extraction requires a partitioning");
        let contained = |v: usize| wanted.contains(&partitioning.partitions[v]);
        let mut vertex_map = vec![usize::MAX; self.num_vertices];
        let mut next = 0usize;
        for vertex in 0..self.num_vertices {
            if contained(vertex) {
                vertex_map[vertex] = next;
                next += 1;
            }
        }
        let mut subgraph = MetisGraph::new();
        for vertex in 0..self.num_vertices {
            if !contained(vertex) {
                continue;
            }
            let mut vertex_weight = self.vwgt[vertex];
            let mut edges = Vec::new();
            for (adjacent, weight) in self.edges_of(vertex) {
                if contained(adjacent) {
                    edges.push((vertex_map[adjacent], weight));
                } else {
                    // External edge: aggregate into the open volume.
                    vertex_weight += weight - 1;
                }
            }
            subgraph.append_vertex(&edges, vertex_weight);
            subgraph.renumber.push(self.original_id(vertex));
        }
        subgraph
    }
}
