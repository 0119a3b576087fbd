//! The skein compiler's graph intermediate representation.
//!
//! A [`Model`] is a typed dataflow DAG of [`Node`]s connected by port
//! references. Compilation rewrites models through [`Transformer`]s driven
//! by registered [`Transformation`]s until every node can render itself
//! against the emitter contract; a [`Map`] wraps a model with named inputs
//! and outputs for the caller.

pub mod archive;
pub mod error;
pub mod map;
pub mod model;
pub mod node;
pub mod port;
pub mod properties;
pub mod refine;
pub mod submodel;
pub mod transformation;
pub mod transformer;

pub use archive::{ArchiveReader, ArchiveWriter, NodeFactory, NodeRegistry};
pub use error::ModelError;
pub use map::{Map, MapRunner};
pub use model::{Evaluator, Model};
pub use node::{Node, NodeIo, node_as};
pub use port::{InputPort, InputPortRef, NodeId, OutputPort, OutputPortRef, PortSpec};
pub use properties::PropertyBag;
pub use refine::RefineTransformation;
pub use submodel::Submodel;
pub use transformation::{
    CompilerOptions, TransformContext, Transformation, TransformationRegistry,
    transform_node_local,
};
pub use transformer::{RefineContext, Transformer};
