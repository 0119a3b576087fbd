//! Loop-nest construction and lowering.
//!
//! A [`LoopNest`] is an outer product of indices with kernels attached at
//! points of the index tree. Its [`Schedule`] rewrites the iteration space
//! (split, reorder, unroll, parallelize) and installs caching providers.
//! Lowering renders the nest against a [`FunctionEmitter`]: one loop per
//! scheduled dimension, kernels fired in registration order at each point
//! where their predicate holds, and a full-tile main loop plus predicated
//! boundary epilogue wherever a split does not divide its range evenly.

use std::collections::{HashMap, HashSet};

use itertools::Itertools;

use crate::builder::FunctionEmitter;
use crate::error::EmitError;
use crate::layout::MemoryLayout;
use crate::module::ValueId;
use crate::types::Scalar;

use super::caching::{CachePlan, CacheSpec, CachingProvider, InPolicy, OutPolicy};
use super::index::{Index, IndexRange};
use super::kernel::{Kernel, KernelCtx, KernelView, ViewAccess};
use super::predicate::{IndexEval, Predicate};

/// `i64::div_ceil` equivalent (signed `div_ceil` is not yet stable).
fn div_ceil_i64(lhs: i64, rhs: i64) -> i64 {
    let d = lhs / rhs;
    let r = lhs % rhs;
    if (r > 0 && rhs > 0) || (r < 0 && rhs < 0) {
        d + 1
    } else {
        d
    }
}

/// Identifies one operand of a loop nest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OperandSlot(pub(crate) usize);

impl OperandSlot {
    /// The slot's position in the nest's operand list.
    pub fn position(self) -> usize {
        self.0
    }
}

/// Whether a kernel fires before descending into deeper loops or after the
/// deeper loops complete.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelPhase {
    /// Fire on the way in (the normal case).
    #[default]
    Body,
    /// Fire after the loops below the placement level have completed.
    Epilogue,
}

/// Where a kernel is attached in the index tree.
#[derive(Clone, Debug, Default)]
pub struct KernelPlacement {
    /// Explicit loop level; when absent, the innermost level over the
    /// kernel's own index set.
    pub at: Option<Vec<Index>>,
    /// Firing phase at that level.
    pub phase: KernelPhase,
}

impl KernelPlacement {
    /// Placement at the level where all the given indices are in scope.
    pub fn at(indices: Vec<Index>) -> Self {
        Self {
            at: Some(indices),
            phase: KernelPhase::Body,
        }
    }

    /// Epilogue placement at the level of the given indices.
    pub fn epilogue_at(indices: Vec<Index>) -> Self {
        Self {
            at: Some(indices),
            phase: KernelPhase::Epilogue,
        }
    }
}

/// A bound operand: the pointer handle and the layout it is addressed by.
#[derive(Clone, Debug)]
pub struct ViewBinding {
    /// Pointer to the operand's storage.
    pub ptr: ValueId,
    /// Logical layout of the operand.
    pub layout: MemoryLayout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChildKind {
    Outer,
    Inner,
}

#[derive(Clone, Debug)]
struct SplitDef {
    outer: Index,
    inner: Index,
    factor: i64,
}

struct PlacedKernel {
    kernel: Kernel,
    predicate: Option<Predicate>,
    placement: KernelPlacement,
}

/// A perfectly-nested affine loop nest over named indices.
pub struct LoopNest {
    next_id: u32,
    roots: Vec<(Index, IndexRange)>,
    splits: HashMap<u32, SplitDef>,
    parent_of: HashMap<u32, (u32, ChildKind)>,
    order: Vec<Index>,
    unrolled: HashSet<u32>,
    parallel: HashMap<u32, usize>,
    operands: Vec<String>,
    kernels: Vec<PlacedKernel>,
    caches: Vec<CachePlan>,
    scratch_limit: Option<usize>,
}

impl Default for LoopNest {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopNest {
    /// An empty nest.
    pub fn new() -> Self {
        Self {
            next_id: 0,
            roots: Vec::new(),
            splits: HashMap::new(),
            parent_of: HashMap::new(),
            order: Vec::new(),
            unrolled: HashSet::new(),
            parallel: HashMap::new(),
            operands: Vec::new(),
            kernels: Vec::new(),
            caches: Vec::new(),
            scratch_limit: None,
        }
    }

    /// Declares a loop index over `[begin, end)`.
    pub fn index(&mut self, name: impl Into<String>, begin: i64, end: i64) -> Index {
        let index = Index::new(self.next_id, name);
        self.next_id += 1;
        self.roots.push((index.clone(), IndexRange { begin, end }));
        self.order.push(index.clone());
        index
    }

    /// Declares an operand slot kernels can view.
    pub fn using(&mut self, name: impl Into<String>) -> OperandSlot {
        self.operands.push(name.into());
        OperandSlot(self.operands.len() - 1)
    }

    /// Number of declared operands.
    pub fn operand_count(&self) -> usize {
        self.operands.len()
    }

    /// Attaches a kernel at its default placement with no predicate.
    pub fn add_kernel(&mut self, kernel: Kernel) {
        self.add_kernel_with(kernel, None, KernelPlacement::default());
    }

    /// Attaches a kernel with a predicate and an explicit placement.
    pub fn add_kernel_with(
        &mut self,
        kernel: Kernel,
        predicate: Option<Predicate>,
        placement: KernelPlacement,
    ) {
        self.kernels.push(PlacedKernel {
            kernel,
            predicate,
            placement,
        });
    }

    /// Caps the total per-invocation scratch (in bytes) caching providers may
    /// allocate.
    pub fn set_scratch_limit(&mut self, bytes: Option<usize>) {
        self.scratch_limit = bytes;
    }

    /// The schedule, for iteration-space transformations.
    pub fn schedule(&mut self) -> Schedule<'_> {
        Schedule { nest: self }
    }

    fn leaf_descendants(&self, id: u32) -> Vec<u32> {
        match self.splits.get(&id) {
            None => vec![id],
            Some(split) => {
                let mut out = self.leaf_descendants(split.outer.id);
                out.extend(self.leaf_descendants(split.inner.id));
                out
            }
        }
    }

    fn range_begin(&self, id: u32) -> i64 {
        self.roots
            .iter()
            .find(|(index, _)| index.id == id)
            .map(|(_, range)| range.begin)
            .unwrap_or(0)
    }

    fn base_extent(&self, id: u32) -> Result<i64, EmitError> {
        if let Some((_, range)) = self.roots.iter().find(|(index, _)| index.id == id) {
            return Ok(range.extent());
        }
        let &(parent, kind) = self.parent_of.get(&id).ok_or_else(|| {
            EmitError::InvalidSchedule(format!("index id {id} does not belong to this nest"))
        })?;
        let factor = self.splits[&parent].factor;
        Ok(match kind {
            ChildKind::Outer => div_ceil_i64(self.base_extent(parent)?, factor),
            ChildKind::Inner => factor,
        })
    }

    fn order_position(&self, leaf: u32) -> Result<usize, EmitError> {
        self.order
            .iter()
            .position(|d| d.id == leaf)
            .ok_or_else(|| {
                EmitError::InvalidSchedule(format!("index id {leaf} is not a scheduled loop"))
            })
    }

    fn level_of_indices(&self, indices: &[Index]) -> Result<usize, EmitError> {
        let mut level = 0;
        for index in indices {
            for leaf in self.leaf_descendants(index.id) {
                level = level.max(self.order_position(leaf)? + 1);
            }
        }
        Ok(level)
    }

    /// Lowers the nest into the given function, with one binding per operand
    /// slot in declaration order.
    pub fn emit(
        &self,
        fx: &mut FunctionEmitter<'_>,
        bindings: &[ViewBinding],
    ) -> Result<(), EmitError> {
        if bindings.len() != self.operands.len() {
            return Err(EmitError::InvalidSchedule(format!(
                "nest declares {} operands but {} bindings were supplied",
                self.operands.len(),
                bindings.len()
            )));
        }
        let mut kernel_levels = Vec::with_capacity(self.kernels.len());
        for placed in &self.kernels {
            let level = match &placed.placement.at {
                Some(at) => self.level_of_indices(at)?,
                None if placed.kernel.index_set().is_empty() => self.order.len(),
                None => self.level_of_indices(placed.kernel.index_set())?,
            };
            kernel_levels.push(level);
        }
        let mut cache_levels = Vec::with_capacity(self.caches.len());
        for plan in &self.caches {
            if plan.spec.slot.0 >= bindings.len() {
                return Err(EmitError::InvalidSchedule(
                    "cache refers to an unknown operand slot".to_owned(),
                ));
            }
            let binding = &bindings[plan.spec.slot.0];
            if binding.layout.rank() != plan.spec.size.len() {
                return Err(EmitError::InvalidSchedule(format!(
                    "cache tile of rank {} over an operand of rank {}",
                    plan.spec.size.len(),
                    binding.layout.rank()
                )));
            }
            let at = if plan.spec.at_indices.is_empty() {
                &plan.spec.kernel_indices
            } else {
                &plan.spec.at_indices
            };
            cache_levels.push(self.level_of_indices(at)?);
        }

        let mut lowering = Lowering {
            nest: self,
            bindings: bindings.to_vec(),
            kernel_levels,
            cache_levels,
            vars: HashMap::new(),
            overrides: HashMap::new(),
            scratch: HashMap::new(),
            activations: Vec::new(),
        };
        // Scratch that is not scoped inside a parallel region is allocated
        // once per invocation, up front.
        for ci in 0..self.caches.len() {
            let level = lowering.cache_levels[ci];
            let under_parallel = self.order[..level.min(self.order.len())]
                .iter()
                .any(|dim| self.parallel.contains_key(&dim.id));
            if !under_parallel {
                lowering.alloc_scratch(fx, ci)?;
            }
        }
        lowering.level(fx, 0)
    }
}

/// Applies iteration-space transformations to a [`LoopNest`].
pub struct Schedule<'n> {
    nest: &'n mut LoopNest,
}

impl Schedule<'_> {
    fn require_loop(&self, index: &Index) -> Result<(), EmitError> {
        if self.nest.order.iter().any(|d| d == index) {
            Ok(())
        } else {
            Err(EmitError::InvalidSchedule(format!(
                "index `{index}` is not a scheduled loop (already split, or foreign)"
            )))
        }
    }

    /// Splits `index` by `factor`, returning `(outer, inner)`. The outer
    /// index keeps the original name; `index` itself stops being a loop and
    /// continues to denote the logical position `outer * factor + inner`.
    pub fn split(&mut self, index: &Index, factor: i64) -> Result<(Index, Index), EmitError> {
        self.require_loop(index)?;
        if factor < 1 {
            return Err(EmitError::InvalidSchedule(format!(
                "split factor must be positive, got {factor}"
            )));
        }
        let outer = Index::new(self.nest.next_id, index.name.clone());
        let inner = Index::new(self.nest.next_id + 1, format!("{}_inner", index.name));
        self.nest.next_id += 2;
        self.nest.splits.insert(
            index.id,
            SplitDef {
                outer: outer.clone(),
                inner: inner.clone(),
                factor,
            },
        );
        self.nest
            .parent_of
            .insert(outer.id, (index.id, ChildKind::Outer));
        self.nest
            .parent_of
            .insert(inner.id, (index.id, ChildKind::Inner));
        let pos = self
            .nest
            .order
            .iter()
            .position(|d| d == index)
            .expect("checked above");
        self.nest.order[pos] = outer.clone();
        self.nest.order.insert(pos + 1, inner.clone());
        // Scheduling attributes do not carry over to the new loops.
        self.nest.unrolled.remove(&index.id);
        self.nest.parallel.remove(&index.id);
        Ok((outer, inner))
    }

    /// Fixes the loop order; the leftmost index is outermost. Every scheduled
    /// loop must appear exactly once.
    pub fn set_order(&mut self, indices: &[Index]) -> Result<(), EmitError> {
        if indices.len() != self.nest.order.len() {
            return Err(EmitError::InvalidSchedule(format!(
                "order lists {} loops, nest has {}",
                indices.len(),
                self.nest.order.len()
            )));
        }
        for index in indices {
            self.require_loop(index)?;
        }
        if !indices.iter().map(|index| index.id).all_unique() {
            return Err(EmitError::InvalidSchedule(
                "an index appears twice in the order".to_owned(),
            ));
        }
        self.nest.order = indices.to_vec();
        Ok(())
    }

    /// Requires the loop to be fully unrolled.
    pub fn unroll(&mut self, index: &Index) -> Result<(), EmitError> {
        self.require_loop(index)?;
        self.nest.unrolled.insert(index.id);
        Ok(())
    }

    /// Splits by `factor` and unrolls the inner loop; returns the outer
    /// index.
    pub fn unroll_by(&mut self, index: &Index, factor: i64) -> Result<Index, EmitError> {
        let (outer, inner) = self.split(index, factor)?;
        self.unroll(&inner)?;
        Ok(outer)
    }

    /// Allows the loop to run on one worker per iteration.
    pub fn parallelize(&mut self, index: &Index) -> Result<(), EmitError> {
        self.require_loop(index)?;
        self.nest.parallel.insert(index.id, 0);
        Ok(())
    }

    /// Splits the range into `threads` chunks and parallelizes the outer
    /// loop; returns the outer index.
    pub fn parallelize_by(&mut self, index: &Index, threads: i64) -> Result<Index, EmitError> {
        if threads < 1 {
            return Err(EmitError::InvalidSchedule(format!(
                "thread count must be positive, got {threads}"
            )));
        }
        let extent = self.nest.base_extent(index.id)?;
        let chunk = div_ceil_i64(extent, threads).max(1);
        let (outer, _inner) = self.split(index, chunk)?;
        self.nest.parallel.insert(outer.id, threads as usize);
        Ok(outer)
    }

    /// Installs a caching provider for one operand.
    pub fn cache(
        &mut self,
        provider: &dyn CachingProvider,
        spec: CacheSpec,
    ) -> Result<(), EmitError> {
        if spec.slot.0 >= self.nest.operands.len() {
            return Err(EmitError::InvalidSchedule(
                "cache refers to an unknown operand slot".to_owned(),
            ));
        }
        let plan = provider.plan(spec)?;
        self.nest.caches.push(plan);
        Ok(())
    }
}

enum TileDirection {
    In,
    Out,
}

struct Lowering<'n> {
    nest: &'n LoopNest,
    bindings: Vec<ViewBinding>,
    kernel_levels: Vec<usize>,
    cache_levels: Vec<usize>,
    vars: HashMap<u32, ValueId>,
    overrides: HashMap<u32, i64>,
    scratch: HashMap<usize, ValueId>,
    activations: Vec<(usize, Vec<ValueId>)>,
}

impl Lowering<'_> {
    fn eff_extent(&self, id: u32) -> Result<i64, EmitError> {
        if let Some(&clamped) = self.overrides.get(&id) {
            return Ok(clamped);
        }
        if let Some((_, range)) = self.nest.roots.iter().find(|(index, _)| index.id == id) {
            return Ok(range.extent());
        }
        let &(parent, kind) = self.nest.parent_of.get(&id).ok_or_else(|| {
            EmitError::InvalidSchedule(format!("index id {id} does not belong to this nest"))
        })?;
        let factor = self.nest.splits[&parent].factor;
        Ok(match kind {
            ChildKind::Outer => div_ceil_i64(self.eff_extent(parent)?, factor),
            ChildKind::Inner => factor,
        })
    }

    fn composed_value(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        id: u32,
        missing_as_zero: bool,
    ) -> Result<ValueId, EmitError> {
        if let Some(split) = self.nest.splits.get(&id) {
            let outer = self.composed_value(fx, split.outer.id, missing_as_zero)?;
            let inner = self.composed_value(fx, split.inner.id, missing_as_zero)?;
            let factor = fx.literal_index(split.factor);
            let tiles = fx.mul(outer, factor)?;
            return fx.add(tiles, inner);
        }
        match self.vars.get(&id) {
            Some(&var) => Ok(var),
            None if missing_as_zero => Ok(fx.literal_index(0)),
            None => Err(EmitError::InvalidSchedule(format!(
                "index id {id} is not in scope at this placement"
            ))),
        }
    }

    fn full_value(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        index: &Index,
        missing_as_zero: bool,
    ) -> Result<ValueId, EmitError> {
        let composed = self.composed_value(fx, index.id, missing_as_zero)?;
        let begin = self.nest.range_begin(index.id);
        if begin == 0 {
            return Ok(composed);
        }
        let begin = fx.literal_index(begin);
        fx.add(begin, composed)
    }

    fn alloc_scratch(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        ci: usize,
    ) -> Result<(), EmitError> {
        let plan = &self.nest.caches[ci];
        let ty = fx
            .value_type(self.bindings[plan.spec.slot.0].ptr)
            .element_type();
        let len = plan.map.scratch_len();
        if let Some(cap) = self.nest.scratch_limit {
            let requested = len * ty.size_of();
            if requested > cap {
                return Err(EmitError::ScratchExhausted { requested, cap });
            }
        }
        let ptr = fx.alloca(ty, len);
        self.scratch.insert(ci, ptr);
        Ok(())
    }

    fn level(&mut self, fx: &mut FunctionEmitter<'_>, depth: usize) -> Result<(), EmitError> {
        let caches_here: Vec<usize> = (0..self.nest.caches.len())
            .filter(|&ci| self.cache_levels[ci] == depth)
            .collect();
        for &ci in &caches_here {
            self.enter_cache(fx, ci)?;
        }
        for ki in 0..self.nest.kernels.len() {
            if self.kernel_levels[ki] == depth
                && self.nest.kernels[ki].placement.phase == KernelPhase::Body
            {
                self.fire(fx, ki)?;
            }
        }
        if depth < self.nest.order.len() {
            self.emit_dim(fx, depth)?;
        }
        for ki in 0..self.nest.kernels.len() {
            if self.kernel_levels[ki] == depth
                && self.nest.kernels[ki].placement.phase == KernelPhase::Epilogue
            {
                self.fire(fx, ki)?;
            }
        }
        for &ci in caches_here.iter().rev() {
            self.exit_cache(fx, ci)?;
        }
        Ok(())
    }

    fn emit_dim(&mut self, fx: &mut FunctionEmitter<'_>, depth: usize) -> Result<(), EmitError> {
        let dim = self.nest.order[depth].clone();
        let id = dim.id;

        // A split that does not divide its parent evenly gets a full-tile
        // main loop here and a predicated boundary epilogue afterwards, with
        // the inner extent clamped to the remainder.
        let boundary = match self.nest.parent_of.get(&id) {
            Some(&(parent, ChildKind::Outer)) => {
                let factor = self.nest.splits[&parent].factor;
                let n = self.eff_extent(parent)?;
                let rem = n % factor;
                if rem != 0 {
                    Some((n / factor, self.nest.splits[&parent].inner.id, rem))
                } else {
                    None
                }
            }
            _ => None,
        };
        let main_extent = match boundary {
            Some((full, _, _)) => full,
            None => self.eff_extent(id)?,
        };

        if self.nest.unrolled.contains(&id) {
            for k in 0..main_extent {
                let var = fx.literal_index(k);
                self.vars.insert(id, var);
                self.level(fx, depth + 1)?;
            }
            self.vars.remove(&id);
        } else if let Some(&threads) = self.nest.parallel.get(&id) {
            self.emit_parallel_dim(fx, depth, id, main_extent, threads)?;
        } else if main_extent > 0 {
            fx.for_range(0, main_extent, |fx, var| {
                self.vars.insert(id, var);
                let result = self.level(fx, depth + 1);
                self.vars.remove(&id);
                result
            })?;
        }

        if let Some((full, inner_id, rem)) = boundary {
            let var = fx.literal_index(full);
            self.vars.insert(id, var);
            self.overrides.insert(inner_id, rem);
            let result = self.level(fx, depth + 1);
            self.overrides.remove(&inner_id);
            self.vars.remove(&id);
            result?;
        }
        Ok(())
    }

    fn emit_parallel_dim(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        depth: usize,
        id: u32,
        extent: i64,
        threads: usize,
    ) -> Result<(), EmitError> {
        if extent <= 0 {
            return Ok(());
        }
        let workers = if threads == 0 {
            extent as usize
        } else {
            threads.min(extent as usize)
        }
        .max(1);
        let per_worker = (extent as usize).div_ceil(workers) as i64;

        let mut captures: Vec<ValueId> = self.bindings.iter().map(|b| b.ptr).collect();
        captures.extend(self.scratch.values().copied());

        let outer_scratch = self.scratch.clone();
        fx.parallel(workers, &captures, |fx, worker| {
            // Caching inside a parallel region gets per-worker scratch.
            for ci in 0..self.nest.caches.len() {
                if self.cache_levels[ci] > depth && !self.scratch.contains_key(&ci) {
                    self.alloc_scratch(fx, ci)?;
                }
            }
            let per = fx.literal_index(per_worker);
            let base = fx.mul(worker, per)?;
            fx.for_range(0, per_worker, |fx, step| {
                let idx = fx.add(base, step)?;
                let bound = fx.literal_index(extent);
                let in_range = fx.lt(idx, bound)?;
                fx.if_then(in_range, |fx| {
                    self.vars.insert(id, idx);
                    let result = self.level(fx, depth + 1);
                    self.vars.remove(&id);
                    result
                })
            })
        })?;
        self.scratch = outer_scratch;
        Ok(())
    }

    fn fire(&mut self, fx: &mut FunctionEmitter<'_>, ki: usize) -> Result<(), EmitError> {
        let kernel = self.nest.kernels[ki].kernel.clone();
        let predicate = self.nest.kernels[ki].predicate.clone();
        let body = kernel.body()?;

        let mut indices = Vec::with_capacity(kernel.index_set().len());
        for index in kernel.index_set() {
            indices.push(self.full_value(fx, index, false)?);
        }
        let mut views = Vec::with_capacity(kernel.arg_slots().len());
        for &slot in kernel.arg_slots() {
            if slot.0 >= self.bindings.len() {
                return Err(EmitError::InvalidSchedule(format!(
                    "kernel `{}` views an unknown operand slot",
                    kernel.name()
                )));
            }
            let binding = &self.bindings[slot.0];
            let active = self
                .activations
                .iter()
                .rev()
                .find(|(ci, _)| self.nest.caches[*ci].spec.slot == slot);
            let view = match active {
                Some(&(ci, ref origins)) => KernelView {
                    ptr: self.scratch[&ci],
                    layout: binding.layout.clone(),
                    access: ViewAccess::Cached {
                        origins: origins.clone(),
                        map: self.nest.caches[ci].map.clone(),
                    },
                },
                None => KernelView {
                    ptr: binding.ptr,
                    layout: binding.layout.clone(),
                    access: ViewAccess::Direct,
                },
            };
            views.push(view);
        }
        let ctx = KernelCtx { indices, views };

        match predicate {
            Some(predicate) => {
                let cond = predicate.emit(fx, self)?;
                fx.if_then(cond, |fx| body(fx, &ctx))
            }
            None => body(fx, &ctx),
        }
    }

    fn enter_cache(&mut self, fx: &mut FunctionEmitter<'_>, ci: usize) -> Result<(), EmitError> {
        let plan = self.nest.caches[ci].clone();
        let mut origins = Vec::with_capacity(plan.spec.kernel_indices.len());
        for index in &plan.spec.kernel_indices {
            origins.push(self.full_value(fx, index, true)?);
        }
        let mut locals = Vec::new();
        self.tile_rec(fx, ci, &plan, &origins, &mut locals, &TileDirection::In)?;
        self.activations.push((ci, origins));
        Ok(())
    }

    fn exit_cache(&mut self, fx: &mut FunctionEmitter<'_>, ci: usize) -> Result<(), EmitError> {
        let (popped, origins) = self.activations.pop().expect("cache activation stack");
        debug_assert_eq!(popped, ci);
        let plan = self.nest.caches[ci].clone();
        if matches!(plan.copy_out, OutPolicy::None) {
            return Ok(());
        }
        let mut locals = Vec::new();
        self.tile_rec(fx, ci, &plan, &origins, &mut locals, &TileDirection::Out)
    }

    fn tile_rec(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        ci: usize,
        plan: &CachePlan,
        origins: &[ValueId],
        locals: &mut Vec<ValueId>,
        direction: &TileDirection,
    ) -> Result<(), EmitError> {
        let d = locals.len();
        if d == plan.spec.size.len() {
            return self.tile_point(fx, ci, plan, origins, locals, direction);
        }
        fx.for_range(0, plan.spec.size[d] as i64, |fx, local| {
            locals.push(local);
            let result = self.tile_rec(fx, ci, plan, origins, locals, direction);
            locals.pop();
            result
        })
    }

    fn tile_point(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        ci: usize,
        plan: &CachePlan,
        origins: &[ValueId],
        locals: &[ValueId],
        direction: &TileDirection,
    ) -> Result<(), EmitError> {
        let binding = self.bindings[plan.spec.slot.0].clone();
        let scratch = self.scratch[&ci];
        let elem = fx.value_type(binding.ptr).element_type();

        let mut globals = Vec::with_capacity(locals.len());
        for (&origin, &local) in origins.iter().zip(locals) {
            globals.push(fx.add(origin, local)?);
        }
        // In-bounds test against the view's active region.
        let mut in_bounds = None;
        for (d, &global) in globals.iter().enumerate() {
            let limit = fx.literal_index(binding.layout.active()[d] as i64);
            let below = fx.lt(global, limit)?;
            in_bounds = Some(match in_bounds {
                None => below,
                Some(prior) => fx.and(prior, below)?,
            });
        }
        let in_bounds = in_bounds.expect("cached views have at least one dimension");
        let scratch_offset = plan.map.emit_offset(fx, locals)?;

        match direction {
            TileDirection::In => match plan.copy_in {
                InPolicy::Zero => {
                    let zero = fx.literal(Scalar::zero(elem));
                    fx.store(scratch, scratch_offset, zero)
                }
                InPolicy::Copy { zero_pad } => {
                    let copy = |fx: &mut FunctionEmitter<'_>| {
                        let view_offset =
                            super::kernel::emit_layout_offset(fx, &binding.layout, &globals)?;
                        let value = fx.load(binding.ptr, view_offset)?;
                        fx.store(scratch, scratch_offset, value)
                    };
                    if zero_pad {
                        fx.if_then_else(in_bounds, copy, |fx| {
                            let zero = fx.literal(Scalar::zero(elem));
                            fx.store(scratch, scratch_offset, zero)
                        })
                    } else {
                        fx.if_then(in_bounds, copy)
                    }
                }
            },
            TileDirection::Out => match plan.copy_out {
                OutPolicy::None => Ok(()),
                OutPolicy::Copy => fx.if_then(in_bounds, |fx| {
                    let view_offset =
                        super::kernel::emit_layout_offset(fx, &binding.layout, &globals)?;
                    let value = fx.load(scratch, scratch_offset)?;
                    fx.store(binding.ptr, view_offset, value)
                }),
                OutPolicy::Reduce => fx.if_then(in_bounds, |fx| {
                    let view_offset =
                        super::kernel::emit_layout_offset(fx, &binding.layout, &globals)?;
                    let current = fx.load(binding.ptr, view_offset)?;
                    let cached = fx.load(scratch, scratch_offset)?;
                    let sum = fx.add(current, cached)?;
                    fx.store(binding.ptr, view_offset, sum)
                }),
            },
        }
    }
}

impl IndexEval for Lowering<'_> {
    fn index_value(
        &mut self,
        fx: &mut FunctionEmitter<'_>,
        index: &Index,
    ) -> Result<ValueId, EmitError> {
        self.full_value(fx, index, false)
    }

    fn index_begin(&self, index: &Index) -> Result<i64, EmitError> {
        Ok(self.nest.range_begin(index.id))
    }

    fn index_end(&self, index: &Index) -> Result<i64, EmitError> {
        Ok(self.nest.range_begin(index.id) + self.eff_extent(index.id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_replaces_the_loop_and_keeps_the_name() {
        let mut nest = LoopNest::new();
        let i = nest.index("i", 0, 10);
        let j = nest.index("j", 0, 3);
        let (i_outer, i_inner) = nest.schedule().split(&i, 4).unwrap();
        assert_eq!("i", i_outer.name());
        assert_eq!("i_inner", i_inner.name());
        assert_eq!(
            vec![i_outer.clone(), i_inner.clone(), j.clone()],
            nest.order
        );
        assert_eq!(3, nest.base_extent(i_outer.id).unwrap());
        assert_eq!(4, nest.base_extent(i_inner.id).unwrap());
        // The split index is no longer schedulable.
        assert!(nest.schedule().unroll(&i).is_err());
    }

    #[test]
    fn set_order_validates_permutations() {
        let mut nest = LoopNest::new();
        let i = nest.index("i", 0, 4);
        let j = nest.index("j", 0, 4);
        assert!(nest.schedule().set_order(&[j.clone(), i.clone()]).is_ok());
        assert!(nest.schedule().set_order(&[i.clone(), i.clone()]).is_err());
        assert!(nest.schedule().set_order(&[i]).is_err());
    }

    #[test]
    fn parallelize_by_splits_into_chunks() {
        let mut nest = LoopNest::new();
        let i = nest.index("i", 0, 10);
        let outer = nest.schedule().parallelize_by(&i, 2).unwrap();
        // 10 split by chunks of 5: two tiles, one per worker.
        assert_eq!(2, nest.base_extent(outer.id).unwrap());
        assert_eq!(Some(&2), nest.parallel.get(&outer.id));
    }

    #[test]
    fn kernel_default_level_is_innermost_of_its_indices() {
        let mut nest = LoopNest::new();
        let i = nest.index("i", 0, 4);
        let _j = nest.index("j", 0, 4);
        let kernel = Kernel::new("k").indices(&[i.clone()]).define(|_, _| Ok(()));
        nest.add_kernel(kernel);
        assert_eq!(1, nest.level_of_indices(&[i]).unwrap());
    }
}
