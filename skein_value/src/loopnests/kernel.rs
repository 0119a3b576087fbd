//! Kernels: the code that runs inside a loop nest.
//!
//! The loops and the schedule exist to call kernels. A kernel is a named,
//! side-effecting operation over a tuple of operand views and a tuple of
//! index values; its body is a closure invoked at code-emission time against
//! the emitter's primitives.

use std::rc::Rc;

use crate::builder::FunctionEmitter;
use crate::error::EmitError;
use crate::layout::MemoryLayout;
use crate::module::ValueId;

use super::caching::CacheMap;
use super::index::Index;
use super::nest::OperandSlot;

/// The body signature: emitter plus the kernel's resolved context.
pub type KernelBody =
    dyn Fn(&mut FunctionEmitter<'_>, &KernelCtx) -> Result<(), EmitError>;

/// A kernel: name, content-addressable id, operand slots, indices, and body.
#[derive(Clone)]
pub struct Kernel {
    name: String,
    id: String,
    args: Vec<OperandSlot>,
    indices: Vec<Index>,
    body: Option<Rc<KernelBody>>,
}

impl Kernel {
    /// A new kernel; the id defaults to the name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            args: Vec::new(),
            indices: Vec::new(),
            body: None,
        }
    }

    /// Overrides the content-addressable id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Declares the operand slots the body will view.
    pub fn args(mut self, args: &[OperandSlot]) -> Self {
        self.args = args.to_vec();
        self
    }

    /// Declares the indices whose values the body receives.
    pub fn indices(mut self, indices: &[Index]) -> Self {
        self.indices = indices.to_vec();
        self
    }

    /// Attaches the body.
    pub fn define<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut FunctionEmitter<'_>, &KernelCtx) -> Result<(), EmitError> + 'static,
    {
        self.body = Some(Rc::new(body));
        self
    }

    /// The kernel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The content-addressable id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared operand slots.
    pub fn arg_slots(&self) -> &[OperandSlot] {
        &self.args
    }

    /// Declared indices.
    pub fn index_set(&self) -> &[Index] {
        &self.indices
    }

    pub(crate) fn body(&self) -> Result<Rc<KernelBody>, EmitError> {
        self.body.clone().ok_or_else(|| {
            EmitError::InvalidSchedule(format!("kernel `{}` has no body", self.name))
        })
    }
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Kernel {}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("indices", &self.indices)
            .finish_non_exhaustive()
    }
}

/// The resolved context a kernel body is invoked with: one value handle per
/// declared index and one view per declared operand slot.
pub struct KernelCtx {
    pub(crate) indices: Vec<ValueId>,
    pub(crate) views: Vec<KernelView>,
}

impl KernelCtx {
    /// The value of the `i`-th declared index.
    pub fn index(&self, i: usize) -> ValueId {
        self.indices[i]
    }

    /// The view of the `i`-th declared operand.
    pub fn view(&self, i: usize) -> &KernelView {
        &self.views[i]
    }
}

/// How a view addresses memory at this firing point.
#[derive(Clone, Debug)]
pub(crate) enum ViewAccess {
    /// Directly through the bound layout.
    Direct,
    /// Redirected into a scratch tile installed by a caching provider.
    Cached {
        origins: Vec<ValueId>,
        map: CacheMap,
    },
}

/// A typed window over one operand, addressed by logical index values.
///
/// When a caching provider is in scope for the operand, loads and stores are
/// transparently redirected into the scratch tile.
#[derive(Clone, Debug)]
pub struct KernelView {
    pub(crate) ptr: ValueId,
    pub(crate) layout: MemoryLayout,
    pub(crate) access: ViewAccess,
}

impl KernelView {
    /// The logical layout of the underlying operand.
    pub fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    /// Loads the element at the given logical index values.
    pub fn load(
        &self,
        fx: &mut FunctionEmitter<'_>,
        index: &[ValueId],
    ) -> Result<ValueId, EmitError> {
        let (ptr, offset) = self.address(fx, index)?;
        fx.load(ptr, offset)
    }

    /// Stores into the element at the given logical index values.
    pub fn store(
        &self,
        fx: &mut FunctionEmitter<'_>,
        index: &[ValueId],
        value: ValueId,
    ) -> Result<(), EmitError> {
        let (ptr, offset) = self.address(fx, index)?;
        fx.store(ptr, offset, value)
    }

    fn address(
        &self,
        fx: &mut FunctionEmitter<'_>,
        index: &[ValueId],
    ) -> Result<(ValueId, ValueId), EmitError> {
        match &self.access {
            ViewAccess::Direct => {
                let offset = emit_layout_offset(fx, &self.layout, index)?;
                Ok((self.ptr, offset))
            }
            ViewAccess::Cached { origins, map } => {
                if origins.len() != index.len() {
                    return Err(EmitError::InvalidSchedule(format!(
                        "cached view addressed with {} indices, expected {}",
                        index.len(),
                        origins.len()
                    )));
                }
                let mut local = Vec::with_capacity(index.len());
                for (&idx, &origin) in index.iter().zip(origins) {
                    local.push(fx.sub(idx, origin)?);
                }
                let offset = map.emit_offset(fx, &local)?;
                Ok((self.ptr, offset))
            }
        }
    }
}

/// Emits the flat element offset of a logical index vector through a layout.
/// Strides are compile-time constants, so the emitted code is a sum of
/// literal-scaled terms.
pub fn emit_layout_offset(
    fx: &mut FunctionEmitter<'_>,
    layout: &MemoryLayout,
    index: &[ValueId],
) -> Result<ValueId, EmitError> {
    if index.len() != layout.rank() {
        return Err(EmitError::InvalidSchedule(format!(
            "view of rank {} addressed with {} indices",
            layout.rank(),
            index.len()
        )));
    }
    let base: usize = layout
        .offset()
        .iter()
        .enumerate()
        .map(|(d, &off)| off * layout.stride(d))
        .sum();
    let mut acc = fx.literal_index(base as i64);
    for (d, &idx) in index.iter().enumerate() {
        let stride = fx.literal_index(layout.stride(d) as i64);
        let term = fx.mul(idx, stride)?;
        acc = fx.add(acc, term)?;
    }
    Ok(acc)
}
