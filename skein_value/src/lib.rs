//! Typed values, memory layouts, loop nests, and the emitter contract for
//! the skein compiler.
//!
//! The crate is the bottom of the stack: it knows nothing about graphs or
//! nodes. It provides:
//!
//! - [`types`] / [`layout`]: element types, host tensors, and
//!   multi-dimensional memory layouts;
//! - [`module`] / [`builder`]: the target-neutral emitter contract: typed
//!   function declarations with emit-once definitions, module globals, and a
//!   structured instruction builder;
//! - [`loopnests`]: declarative affine loop nests with scheduling (split,
//!   reorder, unroll, parallelize), predicated kernels, and caching
//!   providers;
//! - [`backend`]: two conforming backends, an in-process interpreter and a
//!   Rust source renderer.

pub mod backend;
pub mod builder;
pub mod error;
pub mod layout;
pub mod loopnests;
pub mod module;
pub mod types;

pub use builder::FunctionEmitter;
pub use error::{BackendError, EmitError, ValueError};
pub use layout::{DimensionOrder, MemoryLayout};
pub use module::{
    FuncId, FunctionDeclaration, GlobalId, InlineHint, Module, ValueId, ValueType,
};
pub use types::{Buffer, ElementType, HostElement, Scalar, Tensor};
