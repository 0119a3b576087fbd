//! Error types for values, layouts, emission, and backends.

use thiserror::Error;

use crate::types::ElementType;

/// Errors from host-side values and layouts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
    /// A buffer's length disagrees with its layout.
    #[error("layout describes {expected} elements but buffer holds {actual}")]
    LayoutSize {
        /// Element count required by the layout.
        expected: usize,
        /// Element count actually present.
        actual: usize,
    },
    /// Layout components of unequal rank.
    #[error("layout components have rank {actual}, expected {expected}")]
    LayoutRank {
        /// The rank of the first component.
        expected: usize,
        /// The mismatched rank.
        actual: usize,
    },
    /// An offset + active size exceeding the extent.
    #[error(
        "active region (offset {offset} + size {active}) exceeds extent {extent} in dimension {dimension}"
    )]
    ActiveOutsideExtent {
        /// Logical dimension at fault.
        dimension: usize,
        /// Offset in that dimension.
        offset: usize,
        /// Active size in that dimension.
        active: usize,
        /// Extent in that dimension.
        extent: usize,
    },
    /// A dimension order that is not a permutation.
    #[error("dimension order {order:?} is not a permutation")]
    BadDimensionOrder {
        /// The offending order.
        order: Vec<usize>,
    },
    /// An element-type disagreement between host values.
    #[error("expected element type {expected}, found {actual}")]
    ElementType {
        /// The type required.
        expected: ElementType,
        /// The type found.
        actual: ElementType,
    },
}

/// Errors raised while building a module against the emitter contract or
/// lowering loop nests onto it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmitError {
    /// An operation applied to values of incompatible or non-numeric types.
    #[error("type mismatch in emitted `{operation}`: {detail}")]
    TypeMismatch {
        /// The primitive being emitted.
        operation: &'static str,
        /// Explanation.
        detail: String,
    },
    /// A call whose arguments disagree with the declaration.
    #[error("call to `{function}` does not match its declaration: {detail}")]
    SignatureMismatch {
        /// Decorated function name.
        function: String,
        /// Explanation.
        detail: String,
    },
    /// A declaration re-used with a conflicting signature.
    #[error("function `{function}` redeclared with a different signature")]
    ConflictingDeclaration {
        /// Decorated function name.
        function: String,
    },
    /// The active backend cannot render a requested primitive.
    #[error("emitter cannot render `{operation}`: {detail}")]
    CapabilityAbsent {
        /// The primitive requested.
        operation: &'static str,
        /// Explanation.
        detail: String,
    },
    /// A scratch allocation exceeding the configured cap.
    #[error("scratch buffer of {requested} bytes exceeds the cap of {cap} bytes")]
    ScratchExhausted {
        /// Bytes requested.
        requested: usize,
        /// Configured cap.
        cap: usize,
    },
    /// A malformed schedule (unknown index, duplicate order entry, etc.).
    #[error("invalid loop-nest schedule: {0}")]
    InvalidSchedule(String),
    /// Value-layer failure during emission.
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// Errors raised by a backend while lowering or executing a module.
#[derive(Error, Debug)]
pub enum BackendError {
    /// A module that references names or values it never defined.
    #[error("malformed module: {0}")]
    MalformedModule(String),
    /// An external declaration invoked without a host binding.
    #[error("external function `{0}` has no host binding")]
    UnboundExternal(String),
    /// A runtime type disagreement (host handed the wrong tensor type).
    #[error("expected element type {expected}, found {actual}")]
    ElementType {
        /// The type required.
        expected: ElementType,
        /// The type found.
        actual: ElementType,
    },
    /// Host callback failure.
    #[error("host callback `{name}` failed: {message}")]
    Host {
        /// The external function name.
        name: String,
        /// The callback's message.
        message: String,
    },
    /// Emission-layer failure surfaced during lowering.
    #[error(transparent)]
    Emit(#[from] EmitError),
}
