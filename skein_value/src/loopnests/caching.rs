//! Caching providers: materialize tiles of operands into scratch storage.
//!
//! A provider turns a [`CacheSpec`] into a [`CachePlan`]: the tile shape and
//! scratch addressing, plus the copy-in and copy-out policy. The loop-nest
//! lowering allocates the scratch (once per invocation, per worker inside
//! parallel regions), fires the copy kernels at the requested loop level, and
//! redirects in-scope kernel views into the tile.

use crate::builder::FunctionEmitter;
use crate::error::EmitError;
use crate::layout::{DimensionOrder, MemoryLayout};
use crate::module::ValueId;

use super::index::Index;
use super::nest::OperandSlot;

/// How a scratch tile is addressed.
#[derive(Clone, Debug)]
pub enum CacheMap {
    /// A dense tile with its own layout.
    Linear(MemoryLayout),
    /// BLAS-style packing of a two-dimensional tile: column blocks of
    /// `vector` elements laid out block-major, vector-minor.
    Packed {
        /// Vector width of the packing.
        vector: usize,
        /// Tile rows.
        rows: usize,
        /// Tile columns (unpadded).
        cols: usize,
    },
}

impl CacheMap {
    /// Number of scratch elements the map requires.
    pub fn scratch_len(&self) -> usize {
        match self {
            CacheMap::Linear(layout) => layout.allocated_size(),
            CacheMap::Packed { vector, rows, cols } => {
                cols.div_ceil(*vector) * rows * vector
            }
        }
    }

    /// Emits the scratch element offset of tile-local coordinates.
    pub(crate) fn emit_offset(
        &self,
        fx: &mut FunctionEmitter<'_>,
        local: &[ValueId],
    ) -> Result<ValueId, EmitError> {
        match self {
            CacheMap::Linear(layout) => {
                super::kernel::emit_layout_offset(fx, layout, local)
            }
            CacheMap::Packed { vector, rows, cols: _ } => {
                if local.len() != 2 {
                    return Err(EmitError::InvalidSchedule(
                        "packed caches address two-dimensional tiles".to_owned(),
                    ));
                }
                let (r, c) = (local[0], local[1]);
                let v = fx.literal_index(*vector as i64);
                let block = fx.div(c, v)?;
                let inner = fx.rem(c, v)?;
                let panel = fx.literal_index((*rows * *vector) as i64);
                let block_base = fx.mul(block, panel)?;
                let row_base = fx.mul(r, v)?;
                let sum = fx.add(block_base, row_base)?;
                fx.add(sum, inner)
            }
        }
    }
}

/// Reduce function applied when a cached tile is written back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    /// Overwrite the view with the scratch contents.
    Copy,
    /// Sum the scratch contents into the view.
    Sum,
}

/// Boundary handling when the active view is smaller than the tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundaryHandling {
    /// Fill out-of-bounds tile elements with zero.
    ZeroPad,
}

/// Free-form provider parameters.
#[derive(Clone, Debug, Default)]
pub struct CacheExtras {
    /// Vector width for packed strategies.
    pub vector_width: Option<usize>,
    /// Reduce function for the general strategy.
    pub reduce: Option<ReduceOp>,
    /// Boundary handling for the general strategy.
    pub boundary: Option<BoundaryHandling>,
}

/// A request to cache a tile of one operand.
#[derive(Clone, Debug)]
pub struct CacheSpec {
    /// The operand to cache.
    pub slot: OperandSlot,
    /// The indices addressing each view dimension, in view-dimension order.
    pub kernel_indices: Vec<Index>,
    /// The loop level at which the copy kernels fire; defaults to
    /// `kernel_indices` when empty.
    pub at_indices: Vec<Index>,
    /// Scratch tile extent per view dimension.
    pub size: Vec<usize>,
    /// Physical layout of the scratch tile; canonical when absent.
    pub dimension_order: Option<DimensionOrder>,
    /// Provider-specific parameters.
    pub extras: CacheExtras,
}

impl CacheSpec {
    /// A spec with defaults: copy level = kernel indices, canonical scratch
    /// order, no extras.
    pub fn new(slot: OperandSlot, kernel_indices: Vec<Index>, size: Vec<usize>) -> Self {
        Self {
            slot,
            kernel_indices,
            at_indices: Vec::new(),
            size,
            dimension_order: None,
            extras: CacheExtras::default(),
        }
    }

    /// Sets the loop level at which the copy kernels run.
    pub fn at(mut self, at_indices: Vec<Index>) -> Self {
        self.at_indices = at_indices;
        self
    }

    /// Sets the scratch tile's dimension order.
    pub fn ordered(mut self, order: DimensionOrder) -> Self {
        self.dimension_order = Some(order);
        self
    }

    /// Sets provider-specific parameters.
    pub fn extras(mut self, extras: CacheExtras) -> Self {
        self.extras = extras;
        self
    }

    fn linear_map(&self) -> Result<CacheMap, EmitError> {
        let layout = match &self.dimension_order {
            Some(order) => MemoryLayout::with_order(&self.size, order.clone())?,
            None => MemoryLayout::canonical(&self.size),
        };
        Ok(CacheMap::Linear(layout))
    }

    fn check_rank(&self) -> Result<(), EmitError> {
        if self.kernel_indices.is_empty() || self.kernel_indices.len() != self.size.len() {
            return Err(EmitError::InvalidSchedule(format!(
                "cache addressed by {} indices but sized over {} dimensions",
                self.kernel_indices.len(),
                self.size.len()
            )));
        }
        Ok(())
    }
}

/// What happens to the scratch tile when its loop level is entered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InPolicy {
    /// Copy the view tile in; optionally zero-pad past the active region.
    Copy {
        /// Zero out-of-bounds elements instead of leaving them unwritten.
        zero_pad: bool,
    },
    /// Zero the scratch without reading the view.
    Zero,
}

/// What happens to the scratch tile when its loop level is exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutPolicy {
    /// Nothing; the tile was read-only.
    None,
    /// Copy the scratch back over the view tile.
    Copy,
    /// Sum the scratch into the view tile.
    Reduce,
}

/// A validated caching request, ready for lowering.
#[derive(Clone, Debug)]
pub struct CachePlan {
    pub(crate) spec: CacheSpec,
    pub(crate) map: CacheMap,
    pub(crate) copy_in: InPolicy,
    pub(crate) copy_out: OutPolicy,
}

/// A strategy that materializes operand tiles into scratch buffers.
pub trait CachingProvider {
    /// The strategy's name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Validates a spec and produces the lowering plan.
    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError>;
}

/// Copy the tile in at entry and back out at exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyInCopyOut;

impl CachingProvider for CopyInCopyOut {
    fn name(&self) -> &'static str {
        "copy_in_copy_out"
    }

    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError> {
        spec.check_rank()?;
        let map = spec.linear_map()?;
        Ok(CachePlan {
            spec,
            map,
            copy_in: InPolicy::Copy { zero_pad: false },
            copy_out: OutPolicy::Copy,
        })
    }
}

/// Copy the tile in at entry; the tile is read-only.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyIn;

impl CachingProvider for CopyIn {
    fn name(&self) -> &'static str {
        "copy_in"
    }

    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError> {
        spec.check_rank()?;
        let map = spec.linear_map()?;
        Ok(CachePlan {
            spec,
            map,
            copy_in: InPolicy::Copy { zero_pad: false },
            copy_out: OutPolicy::None,
        })
    }
}

/// Zero the tile at entry and sum it into the view at exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroInReduceOut;

impl CachingProvider for ZeroInReduceOut {
    fn name(&self) -> &'static str {
        "zero_in_reduce_out"
    }

    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError> {
        spec.check_rank()?;
        let map = spec.linear_map()?;
        Ok(CachePlan {
            spec,
            map,
            copy_in: InPolicy::Zero,
            copy_out: OutPolicy::Reduce,
        })
    }
}

/// Copy a two-dimensional tile in with BLAS-style packing: column blocks of
/// the vector width, block-major, vector-minor.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlastCopy;

impl BlastCopy {
    /// Default vector width when the spec does not provide one.
    pub const DEFAULT_VECTOR_WIDTH: usize = 4;
}

impl CachingProvider for BlastCopy {
    fn name(&self) -> &'static str {
        "blast_copy"
    }

    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError> {
        spec.check_rank()?;
        if spec.size.len() != 2 {
            return Err(EmitError::InvalidSchedule(
                "blast_copy packs two-dimensional tiles".to_owned(),
            ));
        }
        let vector = spec
            .extras
            .vector_width
            .unwrap_or(Self::DEFAULT_VECTOR_WIDTH);
        if vector == 0 {
            return Err(EmitError::InvalidSchedule(
                "blast_copy vector width must be positive".to_owned(),
            ));
        }
        let map = CacheMap::Packed {
            vector,
            rows: spec.size[0],
            cols: spec.size[1],
        };
        Ok(CachePlan {
            spec,
            map,
            copy_in: InPolicy::Copy { zero_pad: true },
            copy_out: OutPolicy::None,
        })
    }
}

/// The parametric strategy: reduce function and boundary handling are taken
/// from the spec's extras.
#[derive(Clone, Copy, Debug, Default)]
pub struct GeneralCaching;

impl CachingProvider for GeneralCaching {
    fn name(&self) -> &'static str {
        "general"
    }

    fn plan(&self, spec: CacheSpec) -> Result<CachePlan, EmitError> {
        spec.check_rank()?;
        let map = spec.linear_map()?;
        let zero_pad = matches!(spec.extras.boundary, Some(BoundaryHandling::ZeroPad));
        let copy_out = match spec.extras.reduce.unwrap_or(ReduceOp::Copy) {
            ReduceOp::Copy => OutPolicy::Copy,
            ReduceOp::Sum => OutPolicy::Reduce,
        };
        let copy_in = match copy_out {
            OutPolicy::Reduce => InPolicy::Zero,
            _ => InPolicy::Copy { zero_pad },
        };
        Ok(CachePlan {
            spec,
            map,
            copy_in,
            copy_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_indices(n: usize) -> Vec<Index> {
        (0..n).map(|i| Index::new(i as u32, format!("i{i}"))).collect()
    }

    #[test]
    fn packed_scratch_rounds_up_to_whole_blocks() {
        let map = CacheMap::Packed {
            vector: 4,
            rows: 3,
            cols: 10,
        };
        assert_eq!(3 * 4 * 3, map.scratch_len());
    }

    #[test]
    fn blast_copy_requires_two_dimensions() {
        let spec = CacheSpec::new(OperandSlot(0), dummy_indices(1), vec![8]);
        assert!(BlastCopy.plan(spec).is_err());
    }

    #[test]
    fn general_sum_zeroes_on_entry() {
        let spec = CacheSpec::new(OperandSlot(0), dummy_indices(2), vec![2, 2]).extras(CacheExtras {
            reduce: Some(ReduceOp::Sum),
            ..Default::default()
        });
        let plan = GeneralCaching.plan(spec).unwrap();
        assert_eq!(InPolicy::Zero, plan.copy_in);
        assert_eq!(OutPolicy::Reduce, plan.copy_out);
    }

    #[test]
    fn rank_mismatch_is_rejected() {
        let spec = CacheSpec::new(OperandSlot(0), dummy_indices(1), vec![2, 2]);
        assert!(CopyIn.plan(spec).is_err());
    }
}
