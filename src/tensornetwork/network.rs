//! Tensor networks: graphs of tensors connected by contracted dimensions.
//!
//! Vertex 0 is the distinguished output tensor; vertices 1..N are inputs.
//! Every leg stores the adjacent vertex, the adjacent dimension and a
//! direction; finalization checks that all legs pair up consistently.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHasher};

use crate::error::TneError;
use crate::symbolic::{self, SymbolicFactor};
use crate::tensornetwork::tensor::{tensor_hex_name, Tensor};
use crate::types::{DimensionId, LegDirection, TensorId};

/// Id of the output vertex of every tensor network.
pub const OUTPUT_TENSOR: TensorId = 0;

/// One leg of a tensor inside a network: the dual endpoint of an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorLeg {
    tensor_id: TensorId,
    dim_id: DimensionId,
    direction: LegDirection,
}

impl TensorLeg {
    /// Creates a leg pointing at dimension `dim_id` of vertex `tensor_id`.
    #[must_use]
    pub fn new(tensor_id: TensorId, dim_id: DimensionId, direction: LegDirection) -> Self {
        Self {
            tensor_id,
            dim_id,
            direction,
        }
    }

    /// Adjacent vertex id.
    #[must_use]
    pub fn tensor_id(&self) -> TensorId {
        self.tensor_id
    }

    /// Adjacent dimension id.
    #[must_use]
    pub fn dim_id(&self) -> DimensionId {
        self.dim_id
    }

    /// Direction of the leg.
    #[must_use]
    pub fn direction(&self) -> LegDirection {
        self.direction
    }

    /// Redirects the leg to a new endpoint, keeping the direction.
    pub fn reset_connection(&mut self, tensor_id: TensorId, dim_id: DimensionId) {
        self.tensor_id = tensor_id;
        self.dim_id = dim_id;
    }

    /// Reverses the leg direction (no-op for undirected legs).
    pub fn reverse_direction(&mut self) {
        self.direction = self.direction.reversed();
    }
}

/// A tensor placed inside a network, together with its connectivity.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorConn {
    tensor: Tensor,
    id: TensorId,
    legs: Vec<TensorLeg>,
    conjugated: bool,
    optimizable: bool,
}

impl TensorConn {
    fn new(tensor: Tensor, id: TensorId, legs: Vec<TensorLeg>, conjugated: bool) -> Self {
        Self {
            tensor,
            id,
            legs,
            conjugated,
            optimizable: false,
        }
    }

    /// The stored tensor identity.
    #[must_use]
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// Vertex id within the network.
    #[must_use]
    pub fn id(&self) -> TensorId {
        self.id
    }

    /// Ordered legs, one per tensor dimension.
    #[must_use]
    pub fn legs(&self) -> &[TensorLeg] {
        &self.legs
    }

    /// Whether the tensor enters the network complex-conjugated.
    #[must_use]
    pub fn is_conjugated(&self) -> bool {
        self.conjugated
    }

    /// Whether the tensor may be updated by an optimizer (reconstructor).
    #[must_use]
    pub fn is_optimizable(&self) -> bool {
        self.optimizable
    }

    /// Marks the tensor as optimizable. The output tensor cannot be optimized.
    pub fn reset_optimizability(&mut self, optimizable: bool) {
        assert!(
            !optimizable || self.id != OUTPUT_TENSOR,
            "output tensor cannot be optimizable"
        );
        self.optimizable = optimizable;
    }

    /// Renames the stored tensor in place.
    pub fn rename_tensor(&mut self, name: impl Into<String>) {
        self.tensor.rename(name);
    }

    /// Replaces the stored tensor with a dimension-permuted copy, permuting
    /// the legs accordingly. Name-keyed lookups are not re-keyed; consumers
    /// must refetch the connection after this call.
    pub fn replace_stored_tensor(&mut self, order: &[DimensionId]) {
        assert_eq!(order.len(), self.legs.len(), "permutation length mismatch");
        self.tensor = self.tensor.permuted(order);
        let old_legs = self.legs.clone();
        for (new_pos, &old_pos) in order.iter().enumerate() {
            self.legs[new_pos] = old_legs[old_pos as usize];
        }
        let hash = self.tensor.tensor_hash();
        self.tensor.rename(tensor_hex_name("z", hash));
    }

    fn conjugate(&mut self) {
        if self.id != OUTPUT_TENSOR {
            self.conjugated = !self.conjugated;
        }
        for leg in &mut self.legs {
            leg.reverse_direction();
        }
    }

    fn symbolic_factor(&self, labels: &FxHashMap<(TensorId, DimensionId), String>) -> SymbolicFactor {
        SymbolicFactor {
            name: self.tensor.name().to_string(),
            conjugated: self.conjugated,
            indices: (0..self.legs.len())
                .map(|dim| labels[&(self.id, dim as DimensionId)].clone())
                .collect(),
        }
    }
}

/// A tensor network: the output vertex plus connected input tensors.
///
/// # Examples
/// ```
/// # use tne::tensornetwork::network::TensorNetwork;
/// # use tne::tensornetwork::tensor::Tensor;
/// let resolver = |name: &str| match name {
///     "L" => Some(Tensor::new("L", vec![4, 2])),
///     "R" => Some(Tensor::new("R", vec![2, 8])),
///     _ => None,
/// };
/// let network = TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,b)", resolver).unwrap();
/// assert_eq!(network.num_input_tensors(), 2);
/// assert_eq!(network.output_tensor().shape(), &[4, 8]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TensorNetwork {
    name: String,
    tensors: BTreeMap<TensorId, TensorConn>,
    finalized: bool,
}

impl TensorNetwork {
    /// Creates a network holding only an empty (rank-0) output vertex.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let output = Tensor::new(name.clone(), vec![]);
        let mut tensors = BTreeMap::new();
        tensors.insert(
            OUTPUT_TENSOR,
            TensorConn::new(output, OUTPUT_TENSOR, Vec::new(), false),
        );
        Self {
            name,
            tensors,
            finalized: false,
        }
    }

    /// Network name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the network and its output tensor.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
        let name = self.name.clone();
        self.tensors
            .get_mut(&OUTPUT_TENSOR)
            .unwrap()
            .tensor
            .rename(name);
    }

    /// Returns a copy of the network under a new name.
    #[must_use]
    pub fn duplicate(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.rename(name);
        copy
    }

    /// Whether [`TensorNetwork::finalize`] has validated the network.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of input tensors (the output vertex does not count).
    #[must_use]
    pub fn num_input_tensors(&self) -> usize {
        self.tensors.len() - 1
    }

    /// The output tensor identity.
    #[must_use]
    pub fn output_tensor(&self) -> &Tensor {
        self.tensors[&OUTPUT_TENSOR].tensor()
    }

    /// Connection record of one vertex.
    #[must_use]
    pub fn tensor_conn(&self, id: TensorId) -> Option<&TensorConn> {
        self.tensors.get(&id)
    }

    /// Mutable connection record of one vertex.
    pub fn tensor_conn_mut(&mut self, id: TensorId) -> Option<&mut TensorConn> {
        self.tensors.get_mut(&id)
    }

    /// Iterates over all vertices in ascending id order, output first.
    pub fn iter(&self) -> impl Iterator<Item = &TensorConn> {
        self.tensors.values()
    }

    /// Ids of the input vertices in ascending order.
    pub fn input_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors.keys().copied().filter(|&id| id != OUTPUT_TENSOR)
    }

    /// Places an input tensor at the given vertex id. Every leg must point at
    /// an eventual dual leg; consistency is checked by
    /// [`TensorNetwork::finalize`].
    pub fn place_tensor(
        &mut self,
        id: TensorId,
        tensor: Tensor,
        legs: Vec<TensorLeg>,
        conjugated: bool,
    ) -> Result<(), TneError> {
        assert_ne!(id, OUTPUT_TENSOR, "vertex 0 is reserved for the output");
        if self.tensors.contains_key(&id) {
            return Err(TneError::TensorExists(format!("vertex {id}")));
        }
        if legs.len() != tensor.rank() {
            return Err(TneError::DimensionMismatch(format!(
                "tensor `{}` has rank {} but {} legs were given",
                tensor.name(),
                tensor.rank(),
                legs.len()
            )));
        }
        self.tensors
            .insert(id, TensorConn::new(tensor, id, legs, conjugated));
        self.finalized = false;
        Ok(())
    }

    /// Replaces the output tensor with a congruent one (same shape and
    /// signature, any name).
    pub fn replace_output(&mut self, tensor: Tensor) -> Result<(), TneError> {
        let output = self.tensors.get_mut(&OUTPUT_TENSOR).unwrap();
        if !output.tensor.congruent(&tensor) {
            return Err(TneError::ShapeMismatch(format!(
                "output replacement `{}` is not congruent",
                tensor.name()
            )));
        }
        output.tensor = tensor;
        Ok(())
    }

    /// Checks all pairing invariants and synthesizes the output vertex legs.
    ///
    /// Succeeds iff every leg on vertex `i` pointing to `(j, k)` is matched by
    /// the leg at `(j, k)` pointing back at it with equal extent and a
    /// consistent direction. Legs pointing at the output vertex define the
    /// open dimensions of the network in declaration order.
    pub fn finalize(&mut self) -> Result<(), TneError> {
        // Collect the open legs referenced by the inputs.
        let mut open: BTreeMap<DimensionId, TensorLeg> = BTreeMap::new();
        for conn in self.tensors.values() {
            if conn.id == OUTPUT_TENSOR {
                continue;
            }
            for (dim, leg) in conn.legs.iter().enumerate() {
                if leg.tensor_id() == OUTPUT_TENSOR {
                    let dual = TensorLeg::new(
                        conn.id,
                        dim as DimensionId,
                        leg.direction().reversed(),
                    );
                    if open.insert(leg.dim_id(), dual).is_some() {
                        return Err(TneError::DimensionMismatch(format!(
                            "output dimension {} is claimed twice",
                            leg.dim_id()
                        )));
                    }
                }
            }
        }
        // The open dimensions must form a contiguous range 0..n.
        let num_open = open.len();
        if open
            .keys()
            .enumerate()
            .any(|(expected, &dim)| dim as usize != expected)
        {
            return Err(TneError::DimensionMismatch(
                "output dimensions are not contiguous".to_string(),
            ));
        }
        // Rebuild the output vertex if it was not set explicitly.
        {
            let output = &self.tensors[&OUTPUT_TENSOR];
            if output.tensor.rank() != num_open {
                let mut tensor = Tensor::new(self.name.clone(), vec![]);
                for dual in open.values() {
                    let source = &self.tensors[&dual.tensor_id()];
                    tensor.append_dimension(
                        source.tensor.dim_space_attr(dual.dim_id()),
                        source.tensor.dim_extent(dual.dim_id()),
                    );
                }
                let output = self.tensors.get_mut(&OUTPUT_TENSOR).unwrap();
                output.tensor = tensor;
            }
            let output = self.tensors.get_mut(&OUTPUT_TENSOR).unwrap();
            output.legs = open.into_values().collect();
        }
        // Verify the full pairing invariant.
        for conn in self.tensors.values() {
            for (dim, leg) in conn.legs.iter().enumerate() {
                let Some(partner) = self.tensors.get(&leg.tensor_id()) else {
                    return Err(TneError::DimensionMismatch(format!(
                        "vertex {} leg {} points at missing vertex {}",
                        conn.id,
                        dim,
                        leg.tensor_id()
                    )));
                };
                let Some(dual) = partner.legs.get(leg.dim_id() as usize) else {
                    return Err(TneError::DimensionMismatch(format!(
                        "vertex {} has no dimension {}",
                        partner.id,
                        leg.dim_id()
                    )));
                };
                if dual.tensor_id() != conn.id || dual.dim_id() as usize != dim {
                    return Err(TneError::DimensionMismatch(format!(
                        "leg ({}, {dim}) is not mirrored by ({}, {})",
                        conn.id,
                        leg.tensor_id(),
                        leg.dim_id()
                    )));
                }
                if !leg.direction().matches(dual.direction()) {
                    return Err(TneError::DimensionMismatch(format!(
                        "inconsistent leg directions on edge ({}, {dim})",
                        conn.id
                    )));
                }
                let extent = conn.tensor.dim_extent(dim as DimensionId);
                let dual_extent = partner.tensor.dim_extent(leg.dim_id());
                if extent != dual_extent {
                    return Err(TneError::DimensionMismatch(format!(
                        "extent {extent} != {dual_extent} on edge ({}, {dim}) -- ({}, {})",
                        conn.id,
                        leg.tensor_id(),
                        leg.dim_id()
                    )));
                }
            }
        }
        self.finalized = true;
        Ok(())
    }

    /// Deletes an input vertex. Dimensions contracted with it become new open
    /// dimensions appended to the output in the deleted tensor's dimension
    /// order; its former open dimensions are removed from the output.
    /// The network must be re-finalized afterwards.
    pub fn delete_tensor(&mut self, id: TensorId) -> Result<(), TneError> {
        assert_ne!(id, OUTPUT_TENSOR, "cannot delete the output vertex");
        let conn = self
            .tensors
            .remove(&id)
            .ok_or_else(|| TneError::UnknownTensor(format!("vertex {id}")))?;
        // Drop output dimensions that were fed by the deleted vertex.
        let dropped: Vec<DimensionId> = conn
            .legs
            .iter()
            .filter(|leg| leg.tensor_id() == OUTPUT_TENSOR)
            .map(TensorLeg::dim_id)
            .sorted()
            .rev()
            .collect();
        for dim in dropped {
            let output = self.tensors.get_mut(&OUTPUT_TENSOR).unwrap();
            output.tensor.delete_dimension(dim);
            output.legs.remove(dim as usize);
            // Re-point legs at the shifted output dimensions.
            for other in self.tensors.values_mut() {
                for leg in &mut other.legs {
                    if leg.tensor_id() == OUTPUT_TENSOR && leg.dim_id() > dim {
                        leg.reset_connection(OUTPUT_TENSOR, leg.dim_id() - 1);
                    }
                }
            }
        }
        // Open up the dimensions that were contracted with the deleted vertex.
        for (dim, leg) in conn.legs.iter().enumerate() {
            if leg.tensor_id() == OUTPUT_TENSOR {
                continue;
            }
            let extent = conn.tensor.dim_extent(dim as DimensionId);
            let attr = conn.tensor.dim_space_attr(dim as DimensionId);
            let new_dim = self.tensors[&OUTPUT_TENSOR].tensor.rank() as DimensionId;
            let (partner_id, partner_dim, direction) =
                (leg.tensor_id(), leg.dim_id(), leg.direction());
            let partner = self.tensors.get_mut(&partner_id).unwrap();
            partner.legs[partner_dim as usize].reset_connection(OUTPUT_TENSOR, new_dim);
            let output = self.tensors.get_mut(&OUTPUT_TENSOR).unwrap();
            output.tensor.append_dimension(attr, extent);
            output
                .legs
                .push(TensorLeg::new(partner_id, partner_dim, direction));
        }
        self.finalized = false;
        Ok(())
    }

    /// Merges input vertices `left` and `right` into a new vertex `result`,
    /// performing one pairwise contraction. The new vertex carries the
    /// surviving legs of `left` followed by those of `right`; all adjacent
    /// vertices are rewired.
    pub fn merge(
        &mut self,
        left: TensorId,
        right: TensorId,
        result: TensorId,
    ) -> Result<(), TneError> {
        assert!(self.finalized, "merge requires a finalized network");
        assert!(left != right, "cannot merge a vertex with itself");
        assert!(
            left != OUTPUT_TENSOR && right != OUTPUT_TENSOR,
            "cannot merge the output vertex"
        );
        if self.tensors.contains_key(&result) {
            return Err(TneError::TensorExists(format!("vertex {result}")));
        }
        let left_conn = self
            .tensors
            .remove(&left)
            .ok_or_else(|| TneError::UnknownTensor(format!("vertex {left}")))?;
        let right_conn = self
            .tensors
            .remove(&right)
            .ok_or_else(|| TneError::UnknownTensor(format!("vertex {right}")))?;

        let mut tensor = Tensor::new(String::new(), vec![]);
        let mut legs = Vec::new();
        for (conn, partner_id) in [(&left_conn, right), (&right_conn, left)] {
            for (dim, leg) in conn.legs.iter().enumerate() {
                if leg.tensor_id() == partner_id {
                    continue; // contracted dimension
                }
                let new_dim = legs.len() as DimensionId;
                let source = if leg.tensor_id() == left || leg.tensor_id() == right {
                    // Edge between the merged pair's own survivors cannot
                    // occur; legs to self would have been contracted.
                    unreachable!("self-referential leg after removal");
                } else {
                    self.tensors.get_mut(&leg.tensor_id()).unwrap()
                };
                source.legs[leg.dim_id() as usize].reset_connection(result, new_dim);
                tensor.append_dimension(
                    conn.tensor.dim_space_attr(dim as DimensionId),
                    conn.tensor.dim_extent(dim as DimensionId),
                );
                legs.push(*leg);
            }
        }
        let mut hasher = FxHasher::default();
        left_conn.tensor.tensor_hash().hash(&mut hasher);
        right_conn.tensor.tensor_hash().hash(&mut hasher);
        result.hash(&mut hasher);
        tensor.rename(tensor_hex_name("x", hasher.finish()));
        self.tensors
            .insert(result, TensorConn::new(tensor, result, legs, false));
        Ok(())
    }

    /// Complex-conjugates the network: toggles every input tensor's conjugate
    /// flag and reverses all leg directions. The output vertex is a derived
    /// quantity and is never marked conjugated.
    pub fn conjugate(&mut self) {
        for conn in self.tensors.values_mut() {
            conn.conjugate();
        }
    }

    /// Emits the symbolic form `OUT(u0,u1,…) = T1(…) * T2(…) * …`, with `+`
    /// marking conjugated tensors. Requires a finalized network.
    #[must_use]
    pub fn to_symbolic(&self) -> String {
        assert!(self.finalized, "emission requires a finalized network");
        let mut labels: FxHashMap<(TensorId, DimensionId), String> = FxHashMap::default();
        let mut next = 0usize;
        for conn in self.tensors.values() {
            for (dim, leg) in conn.legs.iter().enumerate() {
                let key = (conn.id, dim as DimensionId);
                if labels.contains_key(&key) {
                    continue;
                }
                let label = symbolic::index_label(next);
                next += 1;
                labels.insert(key, label.clone());
                labels.insert((leg.tensor_id(), leg.dim_id()), label);
            }
        }
        let output = self.tensors[&OUTPUT_TENSOR].symbolic_factor(&labels);
        let factors = self
            .tensors
            .values()
            .filter(|conn| conn.id != OUTPUT_TENSOR)
            .map(|conn| conn.symbolic_factor(&labels))
            .collect_vec();
        symbolic::emit_network(&output, &factors)
    }

    /// Parses the symbolic form into a finalized network. Vertex ids follow
    /// textual order; input tensor identities are obtained from `resolver`.
    pub fn from_symbolic(
        text: &str,
        resolver: impl Fn(&str) -> Option<Tensor>,
    ) -> Result<Self, TneError> {
        let spec = symbolic::parse_spec(text)?;
        if spec.rhs.is_empty() {
            return Err(TneError::InvalidSymbolic(
                text.to_string(),
                "a network needs at least one input tensor".to_string(),
            ));
        }
        // Map index labels to their occurrences (vertex, dimension).
        let mut occurrences: FxHashMap<&str, Vec<(TensorId, DimensionId)>> = FxHashMap::default();
        for (pos, index) in spec.lhs.indices.iter().enumerate() {
            occurrences
                .entry(index)
                .or_default()
                .push((OUTPUT_TENSOR, pos as DimensionId));
        }
        for (vertex, factor) in spec.rhs.iter().enumerate() {
            for (pos, index) in factor.indices.iter().enumerate() {
                occurrences
                    .entry(index)
                    .or_default()
                    .push(((vertex + 1) as TensorId, pos as DimensionId));
            }
        }
        for (index, occs) in &occurrences {
            if occs.len() != 2 {
                return Err(TneError::InvalidSymbolic(
                    text.to_string(),
                    format!("index `{index}` must appear exactly twice, found {}", occs.len()),
                ));
            }
        }

        let mut network = TensorNetwork::new(spec.lhs.name.clone());
        for (vertex, factor) in spec.rhs.iter().enumerate() {
            let id = (vertex + 1) as TensorId;
            let tensor = resolver(&factor.name)
                .ok_or_else(|| TneError::UnknownTensor(factor.name.clone()))?;
            if tensor.rank() != factor.indices.len() {
                return Err(TneError::DimensionMismatch(format!(
                    "tensor `{}` has rank {} but pattern lists {} indices",
                    factor.name,
                    tensor.rank(),
                    factor.indices.len()
                )));
            }
            let legs = factor
                .indices
                .iter()
                .enumerate()
                .map(|(pos, index)| {
                    let occs = &occurrences[index.as_str()];
                    let here = (id, pos as DimensionId);
                    let (tensor_id, dim_id) = if occs[0] == here { occs[1] } else { occs[0] };
                    TensorLeg::new(tensor_id, dim_id, LegDirection::Undirected)
                })
                .collect();
            network.place_tensor(id, tensor, legs, factor.conjugated)?;
        }
        network.finalize()?;
        Ok(network)
    }

    /// Generates the accumulative contraction pattern for merging vertices
    /// `left` and `right` into a destination named `dest_name`, e.g.
    /// `_x12ab(u0,u2)+=T1(u0,u1)*T2+(u1,u2)`. With `dest_in_output_order` the
    /// destination indices follow the output vertex's dimension order instead
    /// of the merged survivor order (used for the final contraction of a
    /// plan).
    pub fn merge_pattern(
        &self,
        left: TensorId,
        right: TensorId,
        dest_name: &str,
        dest_in_output_order: bool,
    ) -> Result<String, TneError> {
        let left_conn = self
            .tensor_conn(left)
            .ok_or_else(|| TneError::UnknownTensor(format!("vertex {left}")))?;
        let right_conn = self
            .tensor_conn(right)
            .ok_or_else(|| TneError::UnknownTensor(format!("vertex {right}")))?;

        let mut labels: FxHashMap<(TensorId, DimensionId), String> = FxHashMap::default();
        let mut next = 0usize;
        for conn in [left_conn, right_conn] {
            for (dim, leg) in conn.legs().iter().enumerate() {
                let key = (conn.id(), dim as DimensionId);
                if labels.contains_key(&key) {
                    continue;
                }
                let label = symbolic::index_label(next);
                next += 1;
                labels.insert(key, label.clone());
                if leg.tensor_id() == left || leg.tensor_id() == right {
                    labels.insert((leg.tensor_id(), leg.dim_id()), label);
                }
            }
        }

        let mut dest_indices = Vec::new();
        if dest_in_output_order {
            for leg in self.tensors[&OUTPUT_TENSOR].legs() {
                let key = (leg.tensor_id(), leg.dim_id());
                let label = labels.get(&key).ok_or_else(|| {
                    TneError::DimensionMismatch(
                        "output dimension not fed by the merged pair".to_string(),
                    )
                })?;
                dest_indices.push(label.clone());
            }
        } else {
            for (conn, partner) in [(left_conn, right), (right_conn, left)] {
                for (dim, leg) in conn.legs().iter().enumerate() {
                    if leg.tensor_id() != partner {
                        dest_indices.push(labels[&(conn.id(), dim as DimensionId)].clone());
                    }
                }
            }
        }

        let factor = |conn: &TensorConn| SymbolicFactor {
            name: conn.tensor().name().to_string(),
            conjugated: conn.is_conjugated(),
            indices: (0..conn.legs().len())
                .map(|dim| labels[&(conn.id(), dim as DimensionId)].clone())
                .collect(),
        };
        Ok(symbolic::emit_assignment(
            &SymbolicFactor {
                name: dest_name.to_string(),
                conjugated: false,
                indices: dest_indices,
            },
            &[factor(left_conn), factor(right_conn)],
            true,
        ))
    }

    /// Generates the accumulative addition pattern copying the single input
    /// vertex of the network into a destination ordered like the output
    /// vertex.
    pub fn identity_pattern(&self, dest_name: &str) -> Result<String, TneError> {
        let mut inputs = self.input_ids();
        let (Some(only), None) = (inputs.next(), inputs.next()) else {
            return Err(TneError::DimensionMismatch(
                "identity pattern requires exactly one input tensor".to_string(),
            ));
        };
        let conn = self.tensor_conn(only).unwrap();
        let source_indices: Vec<String> =
            (0..conn.legs().len()).map(symbolic::index_label).collect();
        let dest_indices: Vec<String> = self.tensors[&OUTPUT_TENSOR]
            .legs()
            .iter()
            .map(|leg| {
                assert_eq!(leg.tensor_id(), only, "open leg outside the single input");
                symbolic::index_label(leg.dim_id() as usize)
            })
            .collect();
        Ok(symbolic::emit_assignment(
            &SymbolicFactor {
                name: dest_name.to_string(),
                conjugated: false,
                indices: dest_indices,
            },
            &[SymbolicFactor {
                name: conn.tensor().name().to_string(),
                conjugated: conn.is_conjugated(),
                indices: source_indices,
            }],
            true,
        ))
    }

    /// Renumbering-invariant structural hash: sorted per-vertex profiles of
    /// (log-volume, sorted contracted-edge extents). Used as the plan cache
    /// key.
    #[must_use]
    pub fn structure_hash(&self) -> u64 {
        let mut profiles = Vec::with_capacity(self.num_input_tensors());
        for conn in self.tensors.values() {
            if conn.id == OUTPUT_TENSOR {
                continue;
            }
            let mut open = 1u128;
            let mut edges = Vec::new();
            for (dim, leg) in conn.legs.iter().enumerate() {
                let extent = conn.tensor.dim_extent(dim as DimensionId);
                if leg.tensor_id() == OUTPUT_TENSOR {
                    open *= u128::from(extent);
                } else {
                    edges.push(extent);
                }
            }
            edges.sort_unstable();
            profiles.push((open, edges));
        }
        profiles.sort();
        let mut hasher = FxHasher::default();
        profiles.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(name: &str) -> Option<Tensor> {
        match name {
            "L" => Some(Tensor::new("L", vec![4, 2])),
            "R" => Some(Tensor::new("R", vec![2, 8])),
            "T" => Some(Tensor::new("T", vec![4, 8])),
            "M" => Some(Tensor::new("M", vec![8, 8])),
            "Q" => Some(Tensor::new("Q", vec![8, 4])),
            _ => None,
        }
    }

    #[test]
    fn test_from_symbolic() {
        let network = TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,b)", resolver).unwrap();
        assert!(network.is_finalized());
        assert_eq!(network.num_input_tensors(), 2);
        assert_eq!(network.output_tensor().shape(), &[4, 8]);
        let left = network.tensor_conn(1).unwrap();
        assert_eq!(left.legs()[0].tensor_id(), OUTPUT_TENSOR);
        assert_eq!(left.legs()[1].tensor_id(), 2);
        assert_eq!(left.legs()[1].dim_id(), 0);
    }

    #[test]
    fn test_symbolic_round_trip() {
        let network =
            TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,c)*M(c,b)", resolver).unwrap();
        let emitted = network.to_symbolic();
        let reparsed = TensorNetwork::from_symbolic(&emitted, resolver).unwrap();
        assert_eq!(network, reparsed);
    }

    #[test]
    fn test_extent_mismatch_fails_finalize() {
        let err = TensorNetwork::from_symbolic("D(a,b)=L(a,i)*T(i,b)", resolver).unwrap_err();
        assert!(matches!(err, TneError::DimensionMismatch(_)));
    }

    #[test]
    fn test_single_use_index_rejected() {
        let err = TensorNetwork::from_symbolic("D(a)=L(a,i)*R(i,b)", resolver).unwrap_err();
        assert!(matches!(err, TneError::InvalidSymbolic(_, _)));
    }

    #[test]
    fn test_conjugate_involution() {
        let mut network =
            TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,b)", resolver).unwrap();
        let original = network.clone();
        network.conjugate();
        assert!(network.tensor_conn(1).unwrap().is_conjugated());
        assert!(!network.tensor_conn(0).unwrap().is_conjugated());
        network.conjugate();
        assert_eq!(network, original);
    }

    #[test]
    fn test_merge_replays_to_output() {
        let mut network =
            TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,c)*M(c,b)", resolver).unwrap();
        network.merge(1, 2, 4).unwrap();
        assert_eq!(network.num_input_tensors(), 2);
        let merged = network.tensor_conn(4).unwrap();
        assert_eq!(merged.tensor().shape(), &[4, 8]);
        network.merge(4, 3, 5).unwrap();
        assert_eq!(network.num_input_tensors(), 1);
        let last = network.tensor_conn(5).unwrap();
        assert_eq!(last.tensor().shape(), network.output_tensor().shape());
        // All remaining legs point at the output.
        assert!(last.legs().iter().all(|leg| leg.tensor_id() == OUTPUT_TENSOR));
    }

    #[test]
    fn test_delete_tensor_opens_legs() {
        let mut network =
            TensorNetwork::from_symbolic("D()=L(a,i)*R(i,c)*Q(c,a)", resolver).unwrap();
        network.delete_tensor(2).unwrap();
        network.finalize().unwrap();
        // R had shape [2, 8]; its former partners now feed the output.
        assert_eq!(network.output_tensor().shape(), &[2, 8]);
    }

    #[test]
    fn test_structure_hash_renumbering_invariant() {
        let network_a =
            TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,b)", resolver).unwrap();
        // Same structure, factors in swapped textual order.
        let network_b =
            TensorNetwork::from_symbolic("D(b,a)=R(i,a)*L(b,i)", resolver).unwrap();
        assert_eq!(network_a.structure_hash(), network_b.structure_hash());
        let network_c =
            TensorNetwork::from_symbolic("D(a,b)=L(a,i)*R(i,c)*M(c,b)", resolver).unwrap();
        assert_ne!(network_a.structure_hash(), network_c.structure_hash());
    }
}
