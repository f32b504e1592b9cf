//! Linear combinations of tensor networks (expansions) and linear maps
//! between tensor spaces (operators).

use std::hash::{Hash, Hasher};

use num_complex::Complex64;
use rustc_hash::FxHasher;

use crate::error::TneError;
use crate::tensornetwork::network::{TensorLeg, TensorNetwork, OUTPUT_TENSOR};
use crate::tensornetwork::tensor::{tensor_hex_name, Tensor};
use crate::types::{DimensionId, TensorId};

/// One additive term of a tensor expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpansionComponent {
    /// The tensor network of this term.
    pub network: TensorNetwork,
    /// Complex expansion coefficient.
    pub coefficient: Complex64,
}

/// An ordered linear combination of tensor networks, all sharing the same
/// output shape and signature, tagged as a ket or a bra.
///
/// # Examples
/// ```
/// # use tne::tensornetwork::expansion::TensorExpansion;
/// # use tne::tensornetwork::network::TensorNetwork;
/// # use tne::tensornetwork::tensor::Tensor;
/// # use num_complex::Complex64;
/// let resolver = |name: &str| Some(Tensor::new(name, vec![2, 2]));
/// let network = TensorNetwork::from_symbolic("K(a,b)=T(a,i)*S(i,b)", resolver).unwrap();
/// let mut ket = TensorExpansion::new_ket("Psi");
/// ket.append_network(network, Complex64::new(1.0, 0.0)).unwrap();
/// assert!(ket.is_ket());
/// assert_eq!(ket.rank(), 2);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TensorExpansion {
    name: String,
    components: Vec<ExpansionComponent>,
    ket: bool,
}

impl TensorExpansion {
    /// Creates an empty ket expansion.
    pub fn new_ket(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            ket: true,
        }
    }

    /// Creates an empty bra expansion.
    pub fn new_bra(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
            ket: false,
        }
    }

    /// Expansion name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the expansion.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Returns a copy of the expansion under a new name.
    #[must_use]
    pub fn duplicate(&self, name: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.rename(name);
        copy
    }

    /// Whether this is a ket expansion.
    #[must_use]
    pub fn is_ket(&self) -> bool {
        self.ket
    }

    /// Whether this is a bra expansion.
    #[must_use]
    pub fn is_bra(&self) -> bool {
        !self.ket
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the expansion has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Rank of the common output tensor (0 until a component is appended).
    #[must_use]
    pub fn rank(&self) -> usize {
        self.components
            .first()
            .map_or(0, |c| c.network.output_tensor().rank())
    }

    /// Iterates over the components in order.
    pub fn iter(&self) -> impl Iterator<Item = &ExpansionComponent> {
        self.components.iter()
    }

    /// Mutable iteration over the components.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ExpansionComponent> {
        self.components.iter_mut()
    }

    /// Appends one finalized network with a coefficient. All component
    /// networks must agree in output shape and signature.
    pub fn append_network(
        &mut self,
        network: TensorNetwork,
        coefficient: Complex64,
    ) -> Result<(), TneError> {
        if !network.is_finalized() {
            return Err(TneError::ShapeMismatch(format!(
                "network `{}` is not finalized",
                network.name()
            )));
        }
        if let Some(first) = self.components.first() {
            if !first
                .network
                .output_tensor()
                .congruent(network.output_tensor())
            {
                return Err(TneError::ShapeMismatch(format!(
                    "network `{}` does not match the expansion output shape",
                    network.name()
                )));
            }
        }
        self.components.push(ExpansionComponent {
            network,
            coefficient,
        });
        Ok(())
    }

    /// Appends all components of another expansion, scaled by `scale`. Both
    /// expansions must lie on the same side (ket/bra).
    pub fn append_expansion(
        &mut self,
        other: &TensorExpansion,
        scale: Complex64,
    ) -> Result<(), TneError> {
        if !self.is_empty() && self.ket != other.ket {
            return Err(TneError::ShapeMismatch(format!(
                "cannot append a {} expansion to a {} expansion",
                if other.ket { "ket" } else { "bra" },
                if self.ket { "ket" } else { "bra" }
            )));
        }
        self.ket = other.ket;
        for component in &other.components {
            self.append_network(component.network.clone(), component.coefficient * scale)?;
        }
        Ok(())
    }

    /// Conjugates the expansion: flips ket/bra, complex-conjugates all
    /// coefficients and conjugates every constituent network.
    pub fn conjugate(&mut self) {
        self.ket = !self.ket;
        for component in &mut self.components {
            component.coefficient = component.coefficient.conj();
            component.network.conjugate();
        }
    }

    /// Marks every occurrence of the named tensor as optimizable (or not).
    pub fn reset_optimizability(&mut self, tensor_name: &str, optimizable: bool) {
        for component in &mut self.components {
            let ids: Vec<TensorId> = component.network.input_ids().collect();
            for id in ids {
                let conn = component.network.tensor_conn_mut(id).unwrap();
                if conn.tensor().name() == tensor_name {
                    conn.reset_optimizability(optimizable);
                }
            }
        }
    }

    /// Builds the inner-product expansion `⟨bra|ket⟩`: every bra network is
    /// paired with every ket network into a closed (scalar) network, with
    /// coefficients multiplied.
    pub fn inner_product(
        bra: &TensorExpansion,
        ket: &TensorExpansion,
    ) -> Result<TensorExpansion, TneError> {
        if !bra.is_bra() || !ket.is_ket() {
            return Err(TneError::ShapeMismatch(
                "inner product requires a bra and a ket".to_string(),
            ));
        }
        if bra.rank() != ket.rank() {
            return Err(TneError::ShapeMismatch(format!(
                "rank mismatch between `{}` and `{}`",
                bra.name, ket.name
            )));
        }
        let mut product = TensorExpansion::new_ket(format!("_{}O{}", bra.name, ket.name));
        for bra_component in &bra.components {
            for ket_component in &ket.components {
                let network = pair_networks(&ket_component.network, &bra_component.network)?;
                product.append_network(
                    network,
                    bra_component.coefficient * ket_component.coefficient,
                )?;
            }
        }
        Ok(product)
    }

    /// Builds the derivative expansion with respect to every occurrence of the
    /// named tensor (taken conjugated when `wrt_conjugated`): each occurrence
    /// is removed from its network, leaving its dimensions open in order.
    pub fn derivative(
        &self,
        tensor_name: &str,
        wrt_conjugated: bool,
    ) -> Result<TensorExpansion, TneError> {
        let mut result = TensorExpansion {
            name: format!("_d{}_{tensor_name}", self.name),
            components: Vec::new(),
            ket: self.ket,
        };
        for component in &self.components {
            let ids: Vec<TensorId> = component
                .network
                .iter()
                .filter(|conn| {
                    conn.id() != OUTPUT_TENSOR
                        && conn.tensor().name() == tensor_name
                        && conn.is_conjugated() == wrt_conjugated
                })
                .map(|conn| conn.id())
                .collect();
            for id in ids {
                let mut network = component.network.clone();
                network.delete_tensor(id)?;
                network.finalize()?;
                result.append_network(network, component.coefficient)?;
            }
        }
        Ok(result)
    }
}

/// Joins a ket network and a bra network into one closed network by
/// contracting their open dimensions pairwise.
fn pair_networks(
    ket: &TensorNetwork,
    bra: &TensorNetwork,
) -> Result<TensorNetwork, TneError> {
    let ket_output = ket.tensor_conn(OUTPUT_TENSOR).unwrap();
    let bra_output = bra.tensor_conn(OUTPUT_TENSOR).unwrap();
    if !ket_output.tensor().congruent(bra_output.tensor()) {
        return Err(TneError::ShapeMismatch(format!(
            "cannot pair `{}` with `{}`",
            ket.name(),
            bra.name()
        )));
    }
    let mut hasher = FxHasher::default();
    ket.name().hash(&mut hasher);
    bra.name().hash(&mut hasher);
    let mut network = TensorNetwork::new(tensor_hex_name("s", hasher.finish()));
    let offset = ket.num_input_tensors() as TensorId;

    fn remap(
        leg: &TensorLeg,
        own_shift: TensorId,
        other_output: &[TensorLeg],
        other_shift: TensorId,
    ) -> TensorLeg {
        if leg.tensor_id() == OUTPUT_TENSOR {
            // Connect through the shared open dimension to the other side.
            let dual = other_output[leg.dim_id() as usize];
            TensorLeg::new(dual.tensor_id() + other_shift, dual.dim_id(), leg.direction())
        } else {
            TensorLeg::new(leg.tensor_id() + own_shift, leg.dim_id(), leg.direction())
        }
    }

    for conn in ket.iter().filter(|c| c.id() != OUTPUT_TENSOR) {
        let legs = conn
            .legs()
            .iter()
            .map(|leg| remap(leg, 0, bra_output.legs(), offset))
            .collect();
        network.place_tensor(conn.id(), conn.tensor().clone(), legs, conn.is_conjugated())?;
    }
    for conn in bra.iter().filter(|c| c.id() != OUTPUT_TENSOR) {
        let legs = conn
            .legs()
            .iter()
            .map(|leg| remap(leg, offset, ket_output.legs(), 0))
            .collect();
        network.place_tensor(
            conn.id() + offset,
            conn.tensor().clone(),
            legs,
            conn.is_conjugated(),
        )?;
    }
    network.finalize()?;
    Ok(network)
}

/// One additive component of a tensor operator: a network whose open
/// dimensions are partitioned into a ket map and a bra map.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorComponent {
    /// The component network (a single tensor is a one-vertex network).
    pub network: TensorNetwork,
    /// Pairs `(external_ket_leg, local_output_dim)`.
    pub ket_pairing: Vec<(DimensionId, DimensionId)>,
    /// Pairs `(external_bra_leg, local_output_dim)`.
    pub bra_pairing: Vec<(DimensionId, DimensionId)>,
    /// Complex coefficient.
    pub coefficient: Complex64,
}

/// A linear combination of operator components encoding a map from a ket
/// space to a bra space.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TensorOperator {
    name: String,
    components: Vec<OperatorComponent>,
}

impl TensorOperator {
    /// Creates an empty operator.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            components: Vec::new(),
        }
    }

    /// Operator name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the operator has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Iterates over the components in order.
    pub fn iter(&self) -> impl Iterator<Item = &OperatorComponent> {
        self.components.iter()
    }

    /// Appends a component. The ket and bra maps must be disjoint and
    /// together cover every open dimension of the component network exactly
    /// once.
    pub fn append_component(&mut self, component: OperatorComponent) -> Result<(), TneError> {
        if !component.network.is_finalized() {
            return Err(TneError::ShapeMismatch(format!(
                "network `{}` is not finalized",
                component.network.name()
            )));
        }
        let rank = component.network.output_tensor().rank();
        let mut seen = vec![false; rank];
        for &(_, dim) in component
            .ket_pairing
            .iter()
            .chain(component.bra_pairing.iter())
        {
            let slot = seen.get_mut(dim as usize).ok_or_else(|| {
                TneError::DimensionMismatch(format!("operator leg maps to missing dimension {dim}"))
            })?;
            if *slot {
                return Err(TneError::DimensionMismatch(format!(
                    "dimension {dim} appears in two operator legs"
                )));
            }
            *slot = true;
        }
        if seen.iter().any(|&used| !used) {
            return Err(TneError::DimensionMismatch(
                "operator legs do not cover all open dimensions".to_string(),
            ));
        }
        self.components.push(component);
        Ok(())
    }

    /// Conjugates the operator: swaps the ket and bra maps and conjugates all
    /// component networks and coefficients.
    pub fn conjugate(&mut self) {
        for component in &mut self.components {
            std::mem::swap(&mut component.ket_pairing, &mut component.bra_pairing);
            component.coefficient = component.coefficient.conj();
            component.network.conjugate();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(name: &str) -> Option<Tensor> {
        match name {
            "T" => Some(Tensor::new("T", vec![2, 3])),
            "S" => Some(Tensor::new("S", vec![3, 2])),
            "W" => Some(Tensor::new("W", vec![2, 2])),
            _ => None,
        }
    }

    fn simple_ket() -> TensorExpansion {
        let network = TensorNetwork::from_symbolic("K(a,b)=T(a,i)*S(i,b)", resolver).unwrap();
        let mut ket = TensorExpansion::new_ket("Psi");
        ket.append_network(network, Complex64::new(1.0, 0.5)).unwrap();
        ket
    }

    #[test]
    fn test_conjugate_involution() {
        let mut expansion = simple_ket();
        let original = expansion.clone();
        expansion.conjugate();
        assert!(expansion.is_bra());
        assert_eq!(expansion.iter().next().unwrap().coefficient.im, -0.5);
        expansion.conjugate();
        assert_eq!(expansion, original);
    }

    #[test]
    fn test_duplicate_renames_only() {
        let ket = simple_ket();
        let copy = ket.duplicate("Psi2");
        assert_eq!(copy.name(), "Psi2");
        assert_eq!(copy.len(), ket.len());
        assert_eq!(copy.iter().next().unwrap(), ket.iter().next().unwrap());
    }

    #[test]
    fn test_append_shape_mismatch() {
        let mut expansion = simple_ket();
        let other = TensorNetwork::from_symbolic("K(a,b)=W(a,i)*W(i,b)", resolver).unwrap();
        assert!(matches!(
            expansion.append_network(other, Complex64::new(1.0, 0.0)),
            Err(TneError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_inner_product_is_scalar() {
        let ket = simple_ket();
        let mut bra = ket.clone();
        bra.conjugate();
        let product = TensorExpansion::inner_product(&bra, &ket).unwrap();
        assert_eq!(product.len(), 1);
        let component = product.iter().next().unwrap();
        assert_eq!(component.network.output_tensor().rank(), 0);
        assert_eq!(component.network.num_input_tensors(), 4);
        // |c|^2 of the original coefficient.
        assert_eq!(component.coefficient, Complex64::new(1.25, 0.0));
    }

    #[test]
    fn test_derivative_opens_tensor_shape() {
        let ket = simple_ket();
        let mut bra = ket.clone();
        bra.conjugate();
        let product = TensorExpansion::inner_product(&bra, &ket).unwrap();
        let derivative = product.derivative("S", true).unwrap();
        assert_eq!(derivative.len(), 1);
        let network = &derivative.iter().next().unwrap().network;
        assert_eq!(network.output_tensor().shape(), &[3, 2]);
    }

    #[test]
    fn test_operator_pairing_validation() {
        let network = TensorNetwork::from_symbolic("O(a,b)=W(a,b)", resolver).unwrap();
        let mut operator = TensorOperator::new("H");
        operator
            .append_component(OperatorComponent {
                network: network.clone(),
                ket_pairing: vec![(0, 0)],
                bra_pairing: vec![(0, 1)],
                coefficient: Complex64::new(1.0, 0.0),
            })
            .unwrap();
        assert_eq!(operator.len(), 1);
        // Overlapping maps are rejected.
        assert!(operator
            .append_component(OperatorComponent {
                network,
                ket_pairing: vec![(0, 0)],
                bra_pairing: vec![(0, 0)],
                coefficient: Complex64::new(1.0, 0.0),
            })
            .is_err());
    }
}
