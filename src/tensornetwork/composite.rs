//! Composite tensors: block-decomposed tensors distributed over a process
//! group.
//!
//! A split directive `(dim, depth)` recursively bisects a dimension into
//! `2^depth` segments; the block set is the cartesian product over all split
//! dimensions. An optional selection predicate discards blocks, yielding
//! block-sparse storage.

use std::sync::Arc;

use crate::error::TneError;
use crate::tensornetwork::tensor::Tensor;
use crate::types::{DimExtent, DimOffset, DimensionId, SOME_SPACE};

/// Recursive bisection directive for one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitDirective {
    /// Dimension to split.
    pub dim: DimensionId,
    /// Bisection depth; the dimension splits into `2^depth` segments.
    pub depth: u32,
}

/// Predicate deciding which blocks exist, given the per-split segment indices.
pub type BlockPredicate = Arc<dyn Fn(&[u64]) -> bool + Send + Sync>;

/// One block of a composite tensor.
#[derive(Debug, Clone)]
pub struct TensorBlock {
    /// The block tensor identity (named `parent#index`).
    pub tensor: Tensor,
    /// Element offset of the block within the parent, one per dimension.
    pub offsets: Vec<DimOffset>,
    /// Linear block index within the full (unselected) block grid.
    pub index: u64,
}

/// A tensor decorated with split directives and the resulting blocks.
///
/// # Examples
/// ```
/// # use tne::tensornetwork::composite::{CompositeTensor, SplitDirective};
/// # use tne::tensornetwork::tensor::Tensor;
/// let parent = Tensor::new("C", vec![4, 4, 8, 8]);
/// let composite = CompositeTensor::new(
///     parent,
///     vec![
///         SplitDirective { dim: 2, depth: 1 },
///         SplitDirective { dim: 3, depth: 2 },
///     ],
///     None,
/// )
/// .unwrap();
/// assert_eq!(composite.num_blocks(), 8);
/// ```
#[derive(Clone)]
pub struct CompositeTensor {
    parent: Tensor,
    splits: Vec<SplitDirective>,
    blocks: Vec<TensorBlock>,
}

impl std::fmt::Debug for CompositeTensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTensor")
            .field("parent", &self.parent)
            .field("splits", &self.splits)
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Splits `extent` into `2^depth` segments by recursive bisection. The first
/// half of every bisection takes the extra element of odd ranges. Returns
/// `(offset, extent)` pairs tiling `[0, extent)`.
fn bisect(extent: DimExtent, depth: u32) -> Vec<(DimOffset, DimExtent)> {
    let mut segments = vec![(0, extent)];
    for _ in 0..depth {
        let mut next = Vec::with_capacity(segments.len() * 2);
        for (offset, length) in segments {
            let second = length / 2;
            let first = length - second;
            next.push((offset, first));
            next.push((offset + first, second));
        }
        segments = next;
    }
    segments
}

impl CompositeTensor {
    /// Decomposes `parent` according to `splits`, applying an optional block
    /// selection predicate over the per-split segment indices.
    pub fn new(
        parent: Tensor,
        splits: Vec<SplitDirective>,
        predicate: Option<BlockPredicate>,
    ) -> Result<Self, TneError> {
        for (i, split) in splits.iter().enumerate() {
            if split.dim as usize >= parent.rank() {
                return Err(TneError::DimensionMismatch(format!(
                    "split dimension {} out of range for rank {}",
                    split.dim,
                    parent.rank()
                )));
            }
            if splits[..i].iter().any(|other| other.dim == split.dim) {
                return Err(TneError::DimensionMismatch(format!(
                    "dimension {} is split twice",
                    split.dim
                )));
            }
        }
        let segments: Vec<Vec<(DimOffset, DimExtent)>> = splits
            .iter()
            .map(|split| bisect(parent.dim_extent(split.dim), split.depth))
            .collect();
        let num_blocks: u64 = splits.iter().map(|s| 1u64 << s.depth).product();

        let mut blocks = Vec::new();
        for index in 0..num_blocks {
            // Mixed-radix decomposition of the linear block index, last split
            // fastest.
            let mut rest = index;
            let mut segment_ids = vec![0u64; splits.len()];
            for (pos, split) in splits.iter().enumerate().rev() {
                let radix = 1u64 << split.depth;
                segment_ids[pos] = rest % radix;
                rest /= radix;
            }
            if let Some(predicate) = &predicate {
                if !predicate(&segment_ids) {
                    continue;
                }
            }
            let mut shape = parent.shape().to_vec();
            let mut signature = parent.signature().to_vec();
            let mut offsets = vec![0; parent.rank()];
            for (pos, split) in splits.iter().enumerate() {
                let (offset, extent) = segments[pos][segment_ids[pos] as usize];
                shape[split.dim as usize] = extent;
                offsets[split.dim as usize] = offset;
                let (space, subspace) = signature[split.dim as usize];
                if space == SOME_SPACE {
                    // Anonymous dimensions encode the base offset in the
                    // subspace slot.
                    signature[split.dim as usize] = (space, subspace + offset);
                }
            }
            blocks.push(TensorBlock {
                tensor: Tensor::with_signature(
                    format!("{}#{index}", parent.name()),
                    shape,
                    signature,
                ),
                offsets,
                index,
            });
        }
        Ok(Self {
            parent,
            splits,
            blocks,
        })
    }

    /// The undecomposed parent tensor.
    #[must_use]
    pub fn parent(&self) -> &Tensor {
        &self.parent
    }

    /// The split directives.
    #[must_use]
    pub fn splits(&self) -> &[SplitDirective] {
        &self.splits
    }

    /// Blocks surviving the selection predicate.
    #[must_use]
    pub fn blocks(&self) -> &[TensorBlock] {
        &self.blocks
    }

    /// Number of selected blocks.
    #[must_use]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks of the full grid, always a power of two.
    #[must_use]
    pub fn grid_size(&self) -> u64 {
        self.splits.iter().map(|s| 1u64 << s.depth).product()
    }

    /// Sum of the element counts of the selected blocks.
    #[must_use]
    pub fn total_elements(&self) -> u64 {
        self.blocks.iter().map(|b| b.tensor.volume()).sum()
    }

    /// Index (into the owning group's rank list) of the owner of a block.
    /// The group size must divide the grid size or equal it; blocks are
    /// distributed in contiguous chunks.
    pub fn owner_index(&self, block_index: u64, group_size: usize) -> Result<usize, TneError> {
        let grid = self.grid_size();
        let group_size = group_size as u64;
        if group_size != grid && (group_size == 0 || grid % group_size != 0) {
            return Err(TneError::DomainNesting(format!(
                "group size {group_size} does not divide {grid} blocks"
            )));
        }
        Ok((block_index / (grid / group_size)) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bisect_tiles_range() {
        assert_eq!(bisect(8, 0), vec![(0, 8)]);
        assert_eq!(bisect(8, 1), vec![(0, 4), (4, 4)]);
        assert_eq!(bisect(7, 1), vec![(0, 4), (4, 3)]);
        assert_eq!(bisect(7, 2), vec![(0, 2), (2, 2), (4, 2), (6, 1)]);
        for extent in [1u64, 5, 16, 31] {
            for depth in 0..4 {
                let segments = bisect(extent, depth);
                assert_eq!(segments.len(), 1 << depth);
                let mut expected = 0;
                for (offset, length) in segments {
                    assert_eq!(offset, expected);
                    expected += length;
                }
                assert_eq!(expected, extent);
            }
        }
    }

    #[test]
    fn test_split_block_grid() {
        let parent = Tensor::new("C", vec![4, 4, 8, 8]);
        let composite = CompositeTensor::new(
            parent,
            vec![
                SplitDirective { dim: 2, depth: 1 },
                SplitDirective { dim: 3, depth: 2 },
            ],
            None,
        )
        .unwrap();
        assert_eq!(composite.num_blocks(), 8);
        assert_eq!(composite.grid_size(), 8);
        // Blocks tile the parent without overlap.
        assert_eq!(composite.total_elements(), composite.parent().volume());
        let block = &composite.blocks()[5]; // segments (1, 01) -> offsets (4, 2)
        assert_eq!(block.offsets, vec![0, 0, 4, 2]);
        assert_eq!(block.tensor.shape(), &[4, 4, 4, 2]);
        assert_eq!(block.tensor.name(), "C#5");
    }

    #[test]
    fn test_block_selection_predicate() {
        let parent = Tensor::new("C", vec![8, 8]);
        let diagonal: BlockPredicate = Arc::new(|segments| segments[0] == segments[1]);
        let composite = CompositeTensor::new(
            parent,
            vec![
                SplitDirective { dim: 0, depth: 1 },
                SplitDirective { dim: 1, depth: 1 },
            ],
            Some(diagonal),
        )
        .unwrap();
        assert_eq!(composite.grid_size(), 4);
        assert_eq!(composite.num_blocks(), 2);
        assert_eq!(composite.total_elements(), 2 * 16);
    }

    #[test]
    fn test_owner_distribution() {
        let parent = Tensor::new("C", vec![16]);
        let composite = CompositeTensor::new(
            parent,
            vec![SplitDirective { dim: 0, depth: 2 }],
            None,
        )
        .unwrap();
        // 4 blocks over 2 ranks: contiguous halves.
        assert_eq!(composite.owner_index(0, 2).unwrap(), 0);
        assert_eq!(composite.owner_index(1, 2).unwrap(), 0);
        assert_eq!(composite.owner_index(2, 2).unwrap(), 1);
        assert_eq!(composite.owner_index(3, 2).unwrap(), 1);
        assert!(composite.owner_index(0, 3).is_err());
    }

    #[test]
    fn test_double_split_rejected() {
        let parent = Tensor::new("C", vec![8]);
        assert!(CompositeTensor::new(
            parent,
            vec![
                SplitDirective { dim: 0, depth: 1 },
                SplitDirective { dim: 0, depth: 1 },
            ],
            None,
        )
        .is_err());
    }
}
