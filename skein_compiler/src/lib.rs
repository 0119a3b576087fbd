//! The skein compiler driver.
//!
//! [`MapCompiler`] takes a [`Map`](skein_model::Map), drives the registered
//! transformations to fixpoint, verifies every remaining node can render
//! itself against the emitter contract, and emits a module (one function
//! per node plus an entry function) for a backend. [`CompiledMap`] is the
//! resulting invocation surface: named set-input, compute, named
//! read-output, and direct symbol resolution.

pub mod compile;
pub mod compiled_map;
pub mod error;

pub use compile::{ENTRY_SYMBOL, LoweredMap, MapCompiler};
pub use compiled_map::{CompiledFunction, CompiledMap};
pub use error::CompileError;
