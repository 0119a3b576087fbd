//! Backends consuming the emitter contract.

pub mod interp;
pub mod rust_source;

pub use interp::{HostArg, HostFn, InterpArtifact};
