//! The compiler's error type.

use thiserror::Error;

use skein_model::ModelError;
use skein_value::{BackendError, EmitError};

/// Any failure along the compilation pipeline. Fatal: the partial artifact
/// is discarded and the caller's map is left unchanged.
#[derive(Error, Debug)]
pub enum CompileError {
    /// Graph-layer failure (shape/type mismatch, out-of-order visit,
    /// refinement loop, cycle, archive mismatch).
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Emission-layer failure (capability absent, scratch exhaustion,
    /// invalid schedule).
    #[error(transparent)]
    Emit(#[from] EmitError),
    /// Backend failure (unbound external, malformed module, host callback).
    #[error(transparent)]
    Backend(#[from] BackendError),
}
