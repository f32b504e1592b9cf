//! Basic identifier types, tensor element types and operation codes.

use num_complex::{Complex32, Complex64};
use serde::{Deserialize, Serialize};

/// Id of a registered vector space. Id `0` is the anonymous space.
pub type SpaceId = u32;

/// Id of a subspace within a registered space. For dimensions placed in the
/// anonymous space this value is reinterpreted as the base offset.
pub type SubspaceId = u64;

/// Extent of a tensor dimension.
pub type DimExtent = u64;

/// Base offset of a tensor dimension within its subspace.
pub type DimOffset = u64;

/// Id of a tensor vertex inside a tensor network. Vertex `0` is the output.
pub type TensorId = u32;

/// Position of a dimension within a tensor.
pub type DimensionId = u32;

/// Global rank of a process within the world group.
pub type ProcessRank = u32;

/// Id of a node in the operation DAG.
pub type NodeId = u64;

/// Id of a registered process group.
pub type GroupId = u32;

/// Extent of the anonymous space (space id 0).
pub const MAX_SPACE_DIM: DimExtent = DimExtent::MAX;

/// The anonymous space: every unregistered dimension lives here.
pub const SOME_SPACE: SpaceId = 0;

/// The trivial full subspace automatically registered for every space.
pub const FULL_SUBSPACE: SubspaceId = 0;

/// Direction of a leg (directed edge) in a tensor network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegDirection {
    /// No direction.
    #[default]
    Undirected,
    /// Inward direction.
    Inward,
    /// Outward direction.
    Outward,
}

impl LegDirection {
    /// Returns the reversed direction. Undirected legs are unaffected.
    #[must_use]
    pub fn reversed(self) -> Self {
        match self {
            LegDirection::Undirected => LegDirection::Undirected,
            LegDirection::Inward => LegDirection::Outward,
            LegDirection::Outward => LegDirection::Inward,
        }
    }

    /// Whether `self` on one side of an edge is consistent with `other` on the
    /// opposite side.
    #[must_use]
    pub fn matches(self, other: Self) -> bool {
        other == self.reversed()
    }
}

/// Type of the elements stored in a tensor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Real16,
    Real32,
    Real64,
    Complex16,
    Complex32,
    #[default]
    Complex64,
}

impl ElementType {
    /// Size of one element in bytes.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            ElementType::Real16 => 2,
            ElementType::Real32 | ElementType::Complex16 => 4,
            ElementType::Real64 | ElementType::Complex32 => 8,
            ElementType::Complex64 => 16,
        }
    }

    /// Multiplication factor entering the FMA flop estimate of a contraction
    /// over elements of this type.
    #[must_use]
    pub fn op_factor(self) -> f64 {
        match self {
            ElementType::Real16 | ElementType::Real32 | ElementType::Real64 => 2.0,
            ElementType::Complex16 | ElementType::Complex32 | ElementType::Complex64 => 8.0,
        }
    }

    /// Whether the element type is complex-valued.
    #[must_use]
    pub fn is_complex(self) -> bool {
        matches!(
            self,
            ElementType::Complex16 | ElementType::Complex32 | ElementType::Complex64
        )
    }
}

/// A scalar value of any supported precision. Client calls carry values in
/// their natural type; the engine dispatches at runtime against the element
/// type of the target tensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    R32(f32),
    R64(f64),
    C32(Complex32),
    C64(Complex64),
}

impl ScalarValue {
    /// Widens the value to a double-precision complex scalar.
    #[must_use]
    pub fn to_c64(self) -> Complex64 {
        match self {
            ScalarValue::R32(v) => Complex64::new(f64::from(v), 0.0),
            ScalarValue::R64(v) => Complex64::new(v, 0.0),
            ScalarValue::C32(v) => Complex64::new(f64::from(v.re), f64::from(v.im)),
            ScalarValue::C64(v) => v,
        }
    }

    /// The narrowest element type able to carry this value.
    #[must_use]
    pub fn element_type(self) -> ElementType {
        match self {
            ScalarValue::R32(_) => ElementType::Real32,
            ScalarValue::R64(_) => ElementType::Real64,
            ScalarValue::C32(_) => ElementType::Complex32,
            ScalarValue::C64(_) => ElementType::Complex64,
        }
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::R64(v)
    }
}

impl From<Complex64> for ScalarValue {
    fn from(v: Complex64) -> Self {
        ScalarValue::C64(v)
    }
}

/// Codes of the primitive tensor operations understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TensorOpCode {
    Noop,
    Create,
    Destroy,
    Transform,
    Slice,
    Insert,
    Add,
    Contract,
    DecomposeSvd3,
    DecomposeSvd2,
    OrthogonalizeSvd,
    OrthogonalizeMgs,
    Fetch,
    Upload,
    Broadcast,
    Allreduce,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leg_direction_reversal() {
        assert_eq!(LegDirection::Inward.reversed(), LegDirection::Outward);
        assert_eq!(LegDirection::Outward.reversed(), LegDirection::Inward);
        assert_eq!(LegDirection::Undirected.reversed(), LegDirection::Undirected);
        assert!(LegDirection::Inward.matches(LegDirection::Outward));
        assert!(LegDirection::Undirected.matches(LegDirection::Undirected));
        assert!(!LegDirection::Inward.matches(LegDirection::Inward));
    }

    #[test]
    fn test_element_type_sizes() {
        assert_eq!(ElementType::Real32.size(), 4);
        assert_eq!(ElementType::Complex64.size(), 16);
        assert_eq!(ElementType::Real64.op_factor(), 2.0);
        assert_eq!(ElementType::Complex32.op_factor(), 8.0);
    }

    #[test]
    fn test_scalar_value_widening() {
        assert_eq!(ScalarValue::R32(2.5).to_c64(), Complex64::new(2.5, 0.0));
        assert_eq!(
            ScalarValue::C32(Complex32::new(1.0, -1.0)).to_c64(),
            Complex64::new(1.0, -1.0)
        );
        assert_eq!(ScalarValue::R64(3.0).element_type(), ElementType::Real64);
    }
}
