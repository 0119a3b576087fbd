//! Multi-dimensional memory layouts.
//!
//! A layout describes an allocated rectangle (`extent`), the valid
//! sub-rectangle inside it (`active`), the placement of the active region
//! (`offset`), and a permutation (`order`) giving the physical arrangement of
//! the logical dimensions, listed from physically-major to physically-minor.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::ValueError;

/// A permutation of logical dimensions, listed from physically-major
/// (slowest-varying) to physically-minor (fastest-varying).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DimensionOrder(Vec<usize>);

impl DimensionOrder {
    /// The identity order of the given rank.
    pub fn canonical(rank: usize) -> Self {
        Self((0..rank).collect())
    }

    /// Validates and wraps a permutation.
    pub fn new(order: Vec<usize>) -> Result<Self, ValueError> {
        let mut seen = vec![false; order.len()];
        for &d in &order {
            if d >= order.len() || seen[d] {
                return Err(ValueError::BadDimensionOrder { order });
            }
            seen[d] = true;
        }
        Ok(Self(order))
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Returns true for the identity permutation.
    pub fn is_identity(&self) -> bool {
        self.0.iter().enumerate().all(|(i, &d)| i == d)
    }

    /// The logical dimension at permutation position `i`.
    pub fn get(&self, i: usize) -> usize {
        self.0[i]
    }

    /// The underlying permutation slice.
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// The permutation obtained by applying `self` and then `next`.
    pub fn then(&self, next: &DimensionOrder) -> DimensionOrder {
        DimensionOrder(next.0.iter().map(|&i| self.0[i]).collect())
    }

    /// The inverse permutation.
    pub fn inverse(&self) -> DimensionOrder {
        let mut inv = vec![0; self.0.len()];
        for (i, &d) in self.0.iter().enumerate() {
            inv[d] = i;
        }
        DimensionOrder(inv)
    }

    /// Applies the permutation to a slice: `out[i] = values[order[i]]`.
    pub fn permute<T: Clone>(&self, values: &[T]) -> Vec<T> {
        self.0.iter().map(|&d| values[d].clone()).collect()
    }
}

/// A memory layout: extents, active sizes, offsets, and dimension order, all
/// of equal rank.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryLayout {
    extent: Vec<usize>,
    active: Vec<usize>,
    offset: Vec<usize>,
    order: DimensionOrder,
}

impl MemoryLayout {
    /// A canonical layout: extent = active = `shape`, zero offset, identity
    /// order.
    pub fn canonical(shape: &[usize]) -> Self {
        Self {
            extent: shape.to_vec(),
            active: shape.to_vec(),
            offset: vec![0; shape.len()],
            order: DimensionOrder::canonical(shape.len()),
        }
    }

    /// A one-dimensional canonical layout.
    pub fn vector(len: usize) -> Self {
        Self::canonical(&[len])
    }

    /// A canonical-extent layout with an explicit dimension order.
    pub fn with_order(shape: &[usize], order: DimensionOrder) -> Result<Self, ValueError> {
        if order.rank() != shape.len() {
            return Err(ValueError::LayoutRank {
                expected: shape.len(),
                actual: order.rank(),
            });
        }
        Ok(Self {
            extent: shape.to_vec(),
            active: shape.to_vec(),
            offset: vec![0; shape.len()],
            order,
        })
    }

    /// A fully-specified layout. All four components must have equal rank and
    /// the active region (offset + active) must fit inside the extent.
    pub fn new(
        extent: Vec<usize>,
        active: Vec<usize>,
        offset: Vec<usize>,
        order: DimensionOrder,
    ) -> Result<Self, ValueError> {
        let rank = extent.len();
        if active.len() != rank || offset.len() != rank || order.rank() != rank {
            return Err(ValueError::LayoutRank {
                expected: rank,
                actual: active.len().max(offset.len()).max(order.rank()),
            });
        }
        for d in 0..rank {
            if offset[d] + active[d] > extent[d] {
                return Err(ValueError::ActiveOutsideExtent {
                    dimension: d,
                    offset: offset[d],
                    active: active[d],
                    extent: extent[d],
                });
            }
        }
        Ok(Self {
            extent,
            active,
            offset,
            order,
        })
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.extent.len()
    }

    /// Allocated sizes per logical dimension.
    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    /// Active sizes per logical dimension.
    pub fn active(&self) -> &[usize] {
        &self.active
    }

    /// Offsets of the active region per logical dimension.
    pub fn offset(&self) -> &[usize] {
        &self.offset
    }

    /// The dimension order.
    pub fn order(&self) -> &DimensionOrder {
        &self.order
    }

    /// Total number of allocated elements.
    pub fn allocated_size(&self) -> usize {
        self.extent.iter().product()
    }

    /// Total number of active elements.
    pub fn active_count(&self) -> usize {
        self.active.iter().product()
    }

    /// The stride of a logical dimension: the product of the extents of all
    /// physically-minor dimensions.
    pub fn stride(&self, dim: usize) -> usize {
        let pos = self
            .order
            .as_slice()
            .iter()
            .position(|&d| d == dim)
            .expect("dimension within rank");
        self.order.as_slice()[pos + 1..]
            .iter()
            .map(|&d| self.extent[d])
            .product()
    }

    /// Strides for every logical dimension.
    pub fn strides(&self) -> Vec<usize> {
        (0..self.rank()).map(|d| self.stride(d)).collect()
    }

    /// The flat buffer offset of a logical index vector (relative to the
    /// active region's origin).
    pub fn flat_offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(self.rank(), index.len());
        index
            .iter()
            .zip(&self.offset)
            .enumerate()
            .map(|(d, (&i, &off))| (i + off) * self.stride(d))
            .sum()
    }

    /// True if the order is the identity and the offset is zero.
    pub fn is_canonical(&self) -> bool {
        self.order.is_identity() && self.offset.iter().all(|&o| o == 0)
    }

    /// True if both layouts describe the same active shape traversed in the
    /// same dimension order.
    pub fn is_equivalent(&self, other: &MemoryLayout) -> bool {
        self.active == other.active && self.order == other.order
    }

    /// The canonical layout with the same active shape.
    pub fn canonicalized(&self) -> MemoryLayout {
        Self::canonical(&self.active)
    }

    /// A canonical layout whose shape is this layout's active shape permuted
    /// by `permutation` (dimension `i` of the result is dimension
    /// `permutation[i]` of `self`).
    pub fn transposed(&self, permutation: &DimensionOrder) -> Result<MemoryLayout, ValueError> {
        if permutation.rank() != self.rank() {
            return Err(ValueError::LayoutRank {
                expected: self.rank(),
                actual: permutation.rank(),
            });
        }
        Ok(Self::canonical(&permutation.permute(&self.active)))
    }

    /// Iterates logical index vectors over the active region, row-major in
    /// logical dimension order (dimension 0 slowest).
    pub fn active_indices(&self) -> impl Iterator<Item = Vec<usize>> + '_ {
        self.active.iter().map(|&n| 0..n).multi_cartesian_product()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_strides_are_row_major() {
        let layout = MemoryLayout::canonical(&[2, 3, 4]);
        assert_eq!(vec![12, 4, 1], layout.strides());
        assert_eq!(5, layout.flat_offset(&[0, 1, 1]));
        assert!(layout.is_canonical());
    }

    #[test]
    fn reordered_strides_follow_order() {
        // Logical shape [2, 3, 4], with dimension 2 physically major.
        let order = DimensionOrder::new(vec![2, 0, 1]).unwrap();
        let layout = MemoryLayout::with_order(&[2, 3, 4], order).unwrap();
        assert_eq!(vec![3, 1, 6], layout.strides());
        assert!(!layout.is_canonical());
    }

    #[test]
    fn offset_contributes_to_flat_offset() {
        let layout = MemoryLayout::new(
            vec![4, 6],
            vec![2, 3],
            vec![1, 2],
            DimensionOrder::canonical(2),
        )
        .unwrap();
        assert_eq!(6 + 2, layout.flat_offset(&[0, 0]));
        assert_eq!(2 * 6 + 4, layout.flat_offset(&[1, 2]));
    }

    #[test]
    fn active_region_must_fit() {
        let err = MemoryLayout::new(
            vec![4],
            vec![3],
            vec![2],
            DimensionOrder::canonical(1),
        );
        assert!(err.is_err());
    }

    #[test]
    fn order_composition_and_inverse() {
        let first = DimensionOrder::new(vec![2, 0, 1]).unwrap();
        let second = DimensionOrder::new(vec![1, 2, 0]).unwrap();
        assert!(first.then(&second).is_identity());
        assert_eq!(second, first.inverse());
    }

    #[test]
    fn equivalence_tracks_active_and_order() {
        let a = MemoryLayout::canonical(&[2, 3]);
        let b = MemoryLayout::new(
            vec![4, 5],
            vec![2, 3],
            vec![1, 1],
            DimensionOrder::canonical(2),
        )
        .unwrap();
        assert!(a.is_equivalent(&b));
        let c =
            MemoryLayout::with_order(&[2, 3], DimensionOrder::new(vec![1, 0]).unwrap()).unwrap();
        assert!(!a.is_equivalent(&c));
    }

    #[test]
    fn active_indices_cover_region_in_order() {
        let layout = MemoryLayout::canonical(&[2, 2]);
        let indices: Vec<_> = layout.active_indices().collect();
        assert_eq!(
            vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]],
            indices
        );
    }
}
