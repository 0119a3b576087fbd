//! Errors surfaced by the graph layer and the transformation pipeline.
//!
//! Every error is fatal to the current compilation: the pipeline
//! short-circuits on the first failure, partially built destination models
//! are discarded, and the caller's source model is left untouched.

use thiserror::Error;

use skein_value::{ElementType, EmitError, ValueError};

use crate::port::NodeId;

/// Errors from model construction, transformation, and archiving.
#[derive(Error, Debug)]
pub enum ModelError {
    /// Port layout inconsistency between a producer and a consumer.
    #[error("shape mismatch at node {node:?}: {detail}")]
    ShapeMismatch {
        /// The consuming node, when known.
        node: Option<NodeId>,
        /// Explanation.
        detail: String,
    },
    /// Element-type inconsistency, or a node parameter of the wrong length.
    #[error("type mismatch at node {node:?}: expected {expected}, found {actual}")]
    TypeMismatch {
        /// The offending node, when known.
        node: Option<NodeId>,
        /// The element type required.
        expected: ElementType,
        /// The element type found.
        actual: ElementType,
    },
    /// A transformer was asked for a correspondence that has not been
    /// established yet.
    #[error("out-of-order visit: the producer of a port on node {node:?} has not been visited")]
    OutOfOrderVisit {
        /// The node whose port was requested.
        node: NodeId,
    },
    /// The refinement iteration bound was exceeded with non-compilable nodes
    /// remaining.
    #[error("refinement did not converge after {iterations} iterations; `{type_name}` remains non-compilable")]
    RefinementLoop {
        /// The configured bound.
        iterations: usize,
        /// A remaining non-compilable node type.
        type_name: String,
    },
    /// An archive version unsupported by the reader, or a missing or
    /// ill-typed key.
    #[error("archive mismatch: {0}")]
    ArchiveMismatch(String),
    /// A transformation would introduce a cycle into the destination model.
    #[error("cycle detected involving node {node:?}")]
    CycleDetected {
        /// A node on the cycle.
        node: Option<NodeId>,
    },
    /// A runtime type name with no registered factory.
    #[error("no node type named `{0}` is registered")]
    UnknownNodeType(String),
    /// A named input or output that does not exist on a map.
    #[error("no input or output named `{0}`")]
    UnknownName(String),
    /// A structurally invalid graph operation (dangling port reference,
    /// wrong arity, duplicate name).
    #[error("invalid graph: {0}")]
    InvalidGraph(String),
    /// Value-layer failure (layout or tensor construction).
    #[error(transparent)]
    Value(#[from] ValueError),
    /// Emission-layer failure surfaced through a node capability.
    #[error(transparent)]
    Emit(#[from] EmitError),
}
