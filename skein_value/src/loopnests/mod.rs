//! Declarative loop nests: index algebra, schedules, kernels, and caching.

pub mod caching;
pub mod index;
pub mod kernel;
pub mod nest;
pub mod predicate;

pub use caching::{
    BlastCopy, BoundaryHandling, CacheExtras, CacheMap, CacheSpec, CachingProvider, CopyIn,
    CopyInCopyOut, GeneralCaching, ReduceOp, ZeroInReduceOut,
};
pub use index::{Index, IndexRange};
pub use kernel::{Kernel, KernelCtx, KernelView, emit_layout_offset};
pub use nest::{KernelPhase, KernelPlacement, LoopNest, OperandSlot, Schedule, ViewBinding};
pub use predicate::{Predicate, first, index_at_least, index_equals, index_less, last};
