//! The abstract tensor: an immutable identity `(name, shape, signature)`
//! optionally decorated with isometry groups. Backing storage lives in the
//! runtime tensor store and is addressed by name.

use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::types::{DimExtent, DimensionId, SpaceId, SubspaceId, SOME_SPACE};

/// Space attribution of one tensor dimension. For dimensions in the anonymous
/// space the subspace id is reinterpreted as the base offset.
pub type DimSpaceAttr = (SpaceId, SubspaceId);

/// Abstract tensor identity.
///
/// # Examples
/// ```
/// # use tne::tensornetwork::tensor::Tensor;
/// let tensor = Tensor::new("T", vec![4, 8]);
/// assert_eq!(tensor.rank(), 2);
/// assert_eq!(tensor.volume(), 32);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tensor {
    name: String,
    shape: Vec<DimExtent>,
    signature: Vec<DimSpaceAttr>,
    isometries: Vec<Vec<DimensionId>>,
}

impl Tensor {
    /// Constructs a tensor with all dimensions placed at offset 0 of the
    /// anonymous space.
    pub fn new(name: impl Into<String>, shape: Vec<DimExtent>) -> Self {
        let signature = vec![(SOME_SPACE, 0); shape.len()];
        Self::with_signature(name, shape, signature)
    }

    /// Constructs a tensor with an explicit signature.
    ///
    /// # Panics
    /// Panics if the signature length differs from the shape length.
    pub fn with_signature(
        name: impl Into<String>,
        shape: Vec<DimExtent>,
        signature: Vec<DimSpaceAttr>,
    ) -> Self {
        assert_eq!(
            shape.len(),
            signature.len(),
            "signature length must match shape length"
        );
        Self {
            name: name.into(),
            shape,
            signature,
            isometries: Vec::new(),
        }
    }

    /// Name of the tensor.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the tensor. Hash-keyed consumers must refetch afterwards.
    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// Number of dimensions.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Ordered dimension extents.
    #[must_use]
    pub fn shape(&self) -> &[DimExtent] {
        &self.shape
    }

    /// Ordered per-dimension space attribution.
    #[must_use]
    pub fn signature(&self) -> &[DimSpaceAttr] {
        &self.signature
    }

    /// Extent of one dimension.
    #[must_use]
    pub fn dim_extent(&self, dim: DimensionId) -> DimExtent {
        self.shape[dim as usize]
    }

    /// Space attribution of one dimension.
    #[must_use]
    pub fn dim_space_attr(&self, dim: DimensionId) -> DimSpaceAttr {
        self.signature[dim as usize]
    }

    /// Total number of elements.
    #[must_use]
    pub fn volume(&self) -> u64 {
        self.shape.iter().product()
    }

    /// Whether two tensors agree in shape and signature (names may differ).
    #[must_use]
    pub fn congruent(&self, other: &Tensor) -> bool {
        self.shape == other.shape && self.signature == other.signature
    }

    /// Appends a trailing dimension.
    pub fn append_dimension(&mut self, attr: DimSpaceAttr, extent: DimExtent) {
        self.shape.push(extent);
        self.signature.push(attr);
    }

    /// Deletes a dimension, shifting isometry group members above it down.
    /// Groups containing the deleted dimension are dropped.
    pub fn delete_dimension(&mut self, dim: DimensionId) {
        assert!((dim as usize) < self.shape.len(), "dimension out of range");
        self.shape.remove(dim as usize);
        self.signature.remove(dim as usize);
        self.isometries.retain(|group| !group.contains(&dim));
        for group in &mut self.isometries {
            for member in group.iter_mut() {
                if *member > dim {
                    *member -= 1;
                }
            }
        }
    }

    /// Returns a copy with dimensions reordered by `order` (position `i` of
    /// the result takes dimension `order[i]` of `self`). Isometry groups are
    /// remapped accordingly.
    #[must_use]
    pub fn permuted(&self, order: &[DimensionId]) -> Self {
        assert_eq!(order.len(), self.rank(), "permutation length mismatch");
        let mut inverse = vec![0 as DimensionId; order.len()];
        for (new_pos, &old_pos) in order.iter().enumerate() {
            inverse[old_pos as usize] = new_pos as DimensionId;
        }
        Self {
            name: self.name.clone(),
            shape: order.iter().map(|&d| self.shape[d as usize]).collect(),
            signature: order.iter().map(|&d| self.signature[d as usize]).collect(),
            isometries: self
                .isometries
                .iter()
                .map(|group| {
                    let mut mapped: Vec<DimensionId> =
                        group.iter().map(|&d| inverse[d as usize]).collect();
                    mapped.sort_unstable();
                    mapped
                })
                .collect(),
        }
    }

    /// Registers an isometry group: a set of dimensions whose contraction with
    /// the conjugate tensor yields a Kronecker delta. At most two disjoint
    /// groups are supported.
    ///
    /// # Panics
    /// Panics on a third group, an out-of-range dimension, or overlap with an
    /// existing group.
    pub fn register_isometry(&mut self, mut group: Vec<DimensionId>) {
        assert!(self.isometries.len() < 2, "at most two isometry groups");
        group.sort_unstable();
        group.dedup();
        for &dim in &group {
            assert!((dim as usize) < self.rank(), "isometry dimension out of range");
            assert!(
                !self.isometries.iter().any(|g| g.contains(&dim)),
                "isometry groups must be disjoint"
            );
        }
        if !group.is_empty() {
            self.isometries.push(group);
        }
    }

    /// Drops all isometry groups (used after operations that break isometry).
    pub fn drop_isometries(&mut self) {
        self.isometries.clear();
    }

    /// Registered isometry groups.
    #[must_use]
    pub fn isometries(&self) -> &[Vec<DimensionId>] {
        &self.isometries
    }

    /// Returns the isometry group containing `dim`, if any.
    #[must_use]
    pub fn isometric_group_containing(&self, dim: DimensionId) -> Option<&[DimensionId]> {
        self.isometries
            .iter()
            .find(|group| group.contains(&dim))
            .map(Vec::as_slice)
    }

    /// Structural hash over name, shape and signature.
    #[must_use]
    pub fn tensor_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.name.hash(&mut hasher);
        self.shape.hash(&mut hasher);
        self.signature.hash(&mut hasher);
        hasher.finish()
    }
}

/// Builds a hex-suffixed tensor name from a hash, used for auto-generated
/// intermediates (`_x…`) and gradients (`_g…`).
#[must_use]
pub fn tensor_hex_name(prefix: &str, hash: u64) -> String {
    format!("_{prefix}{hash:016x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tensor() {
        let tensor = Tensor::new("A", vec![2, 3, 4]);
        assert_eq!(tensor.name(), "A");
        assert_eq!(tensor.rank(), 3);
        assert_eq!(tensor.volume(), 24);
        assert_eq!(tensor.dim_space_attr(1), (SOME_SPACE, 0));
    }

    #[test]
    fn test_congruence_ignores_name() {
        let a = Tensor::new("A", vec![2, 3]);
        let mut b = Tensor::new("B", vec![2, 3]);
        assert!(a.congruent(&b));
        b.append_dimension((SOME_SPACE, 0), 4);
        assert!(!a.congruent(&b));
    }

    #[test]
    fn test_delete_dimension_remaps_isometries() {
        let mut tensor = Tensor::new("A", vec![2, 3, 4, 5]);
        tensor.register_isometry(vec![2, 3]);
        tensor.delete_dimension(0);
        assert_eq!(tensor.shape(), &[3, 4, 5]);
        assert_eq!(tensor.isometries(), &[vec![1, 2]]);
        // Deleting a dimension inside the group drops the group.
        tensor.delete_dimension(1);
        assert!(tensor.isometries().is_empty());
    }

    #[test]
    fn test_permuted() {
        let mut tensor = Tensor::with_signature(
            "A",
            vec![2, 3, 4],
            vec![(SOME_SPACE, 0), (SOME_SPACE, 8), (SOME_SPACE, 16)],
        );
        tensor.register_isometry(vec![0, 2]);
        let permuted = tensor.permuted(&[2, 0, 1]);
        assert_eq!(permuted.shape(), &[4, 2, 3]);
        assert_eq!(permuted.signature()[0], (SOME_SPACE, 16));
        assert_eq!(permuted.isometries(), &[vec![0, 1]]);
    }

    #[test]
    #[should_panic(expected = "disjoint")]
    fn test_overlapping_isometries() {
        let mut tensor = Tensor::new("A", vec![2, 3, 4]);
        tensor.register_isometry(vec![0, 1]);
        tensor.register_isometry(vec![1, 2]);
    }

    #[test]
    fn test_hash_depends_on_identity() {
        let a = Tensor::new("A", vec![2, 3]);
        let b = Tensor::new("B", vec![2, 3]);
        assert_ne!(a.tensor_hash(), b.tensor_hash());
        assert_eq!(a.tensor_hash(), a.clone().tensor_hash());
        assert!(tensor_hex_name("x", 0xff).starts_with("_x"));
    }
}
