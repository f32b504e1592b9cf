//! Primitive tensor operations: the nodes of the operation DAG.
//!
//! Every operation is a record `(opcode, operands, scalars, index pattern,
//! id)`; the op-specific payload lives in a sealed sum type sharing that
//! header. Operand roles are fixed per opcode and encoded in a write bitset:
//! a written operand serializes against all earlier accesses of the tensor, a
//! read operand only against its latest writer.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::tensornetwork::tensor::Tensor;
use crate::types::{ElementType, GroupId, NodeId, ProcessRank, TensorOpCode};

/// Initialization and unary transformation kinds of a TRANSFORM operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransformKind {
    /// Set every element to a constant.
    InitValue(Complex64),
    /// Fill with reproducible pseudo-random values in `[-1, 1]`.
    InitRandom { seed: u64 },
    /// Overwrite with explicit column-major data.
    InitData(Vec<Complex64>),
    /// Multiply every element by a constant.
    Scale(Complex64),
}

/// Which factor absorbs the singular values in a two-factor decomposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SvdAbsorb {
    /// Singular values multiply into the left factor.
    Left,
    /// Singular values multiply into the right factor.
    Right,
    /// The square roots of the singular values multiply into both factors.
    Both,
}

/// Op-specific payload of a tensor operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// No operation.
    Noop,
    /// Allocate storage for the given tensor identity. Operand: `[tensor]`.
    Create {
        tensor: Tensor,
        element_type: ElementType,
    },
    /// Release storage after all prior accesses drain. Operand: `[tensor]`.
    Destroy,
    /// Initialize or transform in place. Operand: `[tensor]`.
    Transform { kind: TransformKind },
    /// Extract a slice located by the slice tensor's base offsets.
    /// Operands: `[slice, source]`.
    Slice,
    /// Insert a slice at its base offsets. Operands: `[destination, slice]`.
    Insert,
    /// Accumulate `destination += alpha * source` with an index permutation.
    /// Operands: `[destination, source]`; scalar 0 is `alpha`.
    Add { pattern: String },
    /// Accumulate `destination += alpha * left * right` per the contraction
    /// pattern. Operands: `[destination, left, right]`; scalar 0 is `alpha`.
    Contract { pattern: String },
    /// Three-factor SVD `source = left * middle * right` with a diagonal
    /// middle. Operands: `[left, middle, right, source]`.
    DecomposeSvd3 { pattern: String },
    /// Two-factor SVD with singular-value absorption.
    /// Operands: `[left, right, source]`.
    DecomposeSvd2 { pattern: String, absorb: SvdAbsorb },
    /// Replace the tensor by the isometric part of its SVD. Operand: `[tensor]`.
    OrthogonalizeSvd,
    /// Orthogonalize via Modified Gram-Schmidt. Operand: `[tensor]`.
    OrthogonalizeMgs,
    /// Fetch tensor data from another process. Operand: `[tensor]`.
    Fetch { from: ProcessRank },
    /// Upload tensor data to another process. Operand: `[tensor]`.
    Upload { to: ProcessRank },
    /// Broadcast within a process group. Operand: `[tensor]`.
    Broadcast { root: ProcessRank, group: GroupId },
    /// Element-wise sum-reduction within a process group. Operand: `[tensor]`.
    Allreduce { group: GroupId },
}

/// A primitive tensor operation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorOperation {
    id: NodeId,
    operands: Vec<String>,
    scalars: Vec<Complex64>,
    kind: OpKind,
}

impl TensorOperation {
    /// Builds an operation over the named operands.
    pub fn new(kind: OpKind, operands: Vec<String>, scalars: Vec<Complex64>) -> Self {
        let op = Self {
            id: 0,
            operands,
            scalars,
            kind,
        };
        debug_assert!(
            op.operands.len() >= op.min_operands(),
            "{:?} requires at least {} operands",
            op.opcode(),
            op.min_operands()
        );
        op
    }

    /// Builds a CREATE operation from a tensor identity.
    pub fn create(tensor: Tensor, element_type: ElementType) -> Self {
        let name = tensor.name().to_string();
        Self::new(
            OpKind::Create {
                tensor,
                element_type,
            },
            vec![name],
            vec![],
        )
    }

    /// Builds a DESTROY operation.
    pub fn destroy(name: impl Into<String>) -> Self {
        Self::new(OpKind::Destroy, vec![name.into()], vec![])
    }

    /// The tensor identity carried by a CREATE operation.
    #[must_use]
    pub fn tensor_meta(&self) -> Option<&Tensor> {
        match &self.kind {
            OpKind::Create { tensor, .. } => Some(tensor),
            _ => None,
        }
    }

    /// DAG node id; 0 until the operation is appended to a DAG.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }

    /// Named operands, the written ones first.
    #[must_use]
    pub fn operands(&self) -> &[String] {
        &self.operands
    }

    /// Scalar arguments (prefactors).
    #[must_use]
    pub fn scalars(&self) -> &[Complex64] {
        &self.scalars
    }

    /// The op-specific payload.
    #[must_use]
    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// The operation code.
    #[must_use]
    pub fn opcode(&self) -> TensorOpCode {
        match self.kind {
            OpKind::Noop => TensorOpCode::Noop,
            OpKind::Create { .. } => TensorOpCode::Create,
            OpKind::Destroy => TensorOpCode::Destroy,
            OpKind::Transform { .. } => TensorOpCode::Transform,
            OpKind::Slice => TensorOpCode::Slice,
            OpKind::Insert => TensorOpCode::Insert,
            OpKind::Add { .. } => TensorOpCode::Add,
            OpKind::Contract { .. } => TensorOpCode::Contract,
            OpKind::DecomposeSvd3 { .. } => TensorOpCode::DecomposeSvd3,
            OpKind::DecomposeSvd2 { .. } => TensorOpCode::DecomposeSvd2,
            OpKind::OrthogonalizeSvd => TensorOpCode::OrthogonalizeSvd,
            OpKind::OrthogonalizeMgs => TensorOpCode::OrthogonalizeMgs,
            OpKind::Fetch { .. } => TensorOpCode::Fetch,
            OpKind::Upload { .. } => TensorOpCode::Upload,
            OpKind::Broadcast { .. } => TensorOpCode::Broadcast,
            OpKind::Allreduce { .. } => TensorOpCode::Allreduce,
        }
    }

    /// The symbolic index pattern, for the operations that carry one.
    #[must_use]
    pub fn index_pattern(&self) -> Option<&str> {
        match &self.kind {
            OpKind::Add { pattern }
            | OpKind::Contract { pattern }
            | OpKind::DecomposeSvd3 { pattern }
            | OpKind::DecomposeSvd2 { pattern, .. } => Some(pattern),
            _ => None,
        }
    }

    fn min_operands(&self) -> usize {
        match self.kind {
            OpKind::Noop => 0,
            OpKind::Create { .. }
            | OpKind::Destroy
            | OpKind::Transform { .. }
            | OpKind::OrthogonalizeSvd
            | OpKind::OrthogonalizeMgs
            | OpKind::Fetch { .. }
            | OpKind::Upload { .. }
            | OpKind::Broadcast { .. }
            | OpKind::Allreduce { .. } => 1,
            OpKind::Slice | OpKind::Insert | OpKind::Add { .. } => 2,
            OpKind::Contract { .. } | OpKind::DecomposeSvd2 { .. } => 3,
            OpKind::DecomposeSvd3 { .. } => 4,
        }
    }

    /// Bitset over operand indices: a set bit marks a written operand.
    #[must_use]
    pub fn write_mask(&self) -> u32 {
        match self.kind {
            OpKind::Noop | OpKind::Upload { .. } => 0b0,
            OpKind::Create { .. }
            | OpKind::Destroy
            | OpKind::Transform { .. }
            | OpKind::Slice
            | OpKind::Insert
            | OpKind::Add { .. }
            | OpKind::Contract { .. }
            | OpKind::OrthogonalizeSvd
            | OpKind::OrthogonalizeMgs
            | OpKind::Fetch { .. }
            | OpKind::Broadcast { .. }
            | OpKind::Allreduce { .. } => 0b1,
            OpKind::DecomposeSvd2 { .. } => 0b011,
            OpKind::DecomposeSvd3 { .. } => 0b0111,
        }
    }

    /// Operands written by this operation.
    pub fn written_operands(&self) -> impl Iterator<Item = &str> {
        let mask = self.write_mask();
        self.operands
            .iter()
            .enumerate()
            .filter(move |(i, _)| mask & (1 << i) != 0)
            .map(|(_, name)| name.as_str())
    }

    /// Operands only read by this operation.
    pub fn read_operands(&self) -> impl Iterator<Item = &str> {
        let mask = self.write_mask();
        self.operands
            .iter()
            .enumerate()
            .filter(move |(i, _)| mask & (1 << i) == 0)
            .map(|(_, name)| name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_roles() {
        let contract = TensorOperation::new(
            OpKind::Contract {
                pattern: "D(a,b)+=L(a,i)*R(i,b)".to_string(),
            },
            vec!["D".into(), "L".into(), "R".into()],
            vec![Complex64::new(1.0, 0.0)],
        );
        assert_eq!(contract.opcode(), TensorOpCode::Contract);
        assert_eq!(contract.written_operands().collect::<Vec<_>>(), vec!["D"]);
        assert_eq!(
            contract.read_operands().collect::<Vec<_>>(),
            vec!["L", "R"]
        );
        assert!(contract.index_pattern().is_some());
    }

    #[test]
    fn test_svd_writes_factors() {
        let svd = TensorOperation::new(
            OpKind::DecomposeSvd3 {
                pattern: "D(a,b)=L(a,k)*S(k,l)*R(l,b)".to_string(),
            },
            vec!["L".into(), "S".into(), "R".into(), "D".into()],
            vec![],
        );
        assert_eq!(
            svd.written_operands().collect::<Vec<_>>(),
            vec!["L", "S", "R"]
        );
        assert_eq!(svd.read_operands().collect::<Vec<_>>(), vec!["D"]);
    }

    #[test]
    fn test_upload_only_reads() {
        let upload = TensorOperation::new(OpKind::Upload { to: 3 }, vec!["T".into()], vec![]);
        assert_eq!(upload.written_operands().count(), 0);
        assert_eq!(upload.read_operands().collect::<Vec<_>>(), vec!["T"]);
    }
}
