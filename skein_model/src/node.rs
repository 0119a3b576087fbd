//! The node capability trait.
//!
//! A node is an operator with typed input and output ports and a small set
//! of capabilities: every node can be cloned, archived, and computed
//! (reference semantics); a node may additionally *refine* (emit an
//! equivalent subgraph of more primitive nodes into a transformer) or
//! *compile* (render itself against the emitter contract). Nodes that do
//! neither are copied verbatim by transformations and rejected by the
//! compiler's final compilability check.

use std::any::Any;

use skein_value::loopnests::ViewBinding;
use skein_value::{EmitError, FunctionEmitter, Tensor};

use crate::archive::ArchiveWriter;
use crate::error::ModelError;
use crate::port::PortSpec;
use crate::transformer::RefineContext;

/// The buffers a node's emitted function operates on: one view per input
/// port, then one per output port.
pub struct NodeIo {
    /// Input views, in port order.
    pub inputs: Vec<ViewBinding>,
    /// Output views, in port order.
    pub outputs: Vec<ViewBinding>,
    /// The node's state buffer, for nodes with [`Node::initial_state`].
    pub state: Option<ViewBinding>,
    /// Cap on caching scratch, in bytes, from the compiler options.
    pub scratch_limit: Option<usize>,
}

/// An operator in the graph.
pub trait Node: Any {
    /// The runtime type name, used for registry lookup and archives.
    fn type_name(&self) -> &'static str;

    /// Schema version of this node's archive format.
    fn archive_version(&self) -> u32 {
        1
    }

    /// The specs of this node's output ports.
    fn output_specs(&self) -> Vec<PortSpec>;

    /// Checks the specs of the output ports this node is being connected
    /// to. Called once, at insertion into a model.
    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError>;

    /// Clones the node.
    fn clone_box(&self) -> Box<dyn Node>;

    /// Whether [`Node::compile`] is implemented.
    fn is_compilable(&self) -> bool {
        false
    }

    /// Renders the node's computation against the emitter contract. The
    /// default has no compile capability.
    fn compile(&self, _fx: &mut FunctionEmitter<'_>, _io: &NodeIo) -> Result<(), EmitError> {
        Err(EmitError::CapabilityAbsent {
            operation: "compile",
            detail: format!("node type `{}` cannot compile itself", self.type_name()),
        })
    }

    /// Emits an equivalent subgraph of more primitive nodes into the
    /// transformer. Returns `true` if the node refined itself; the default
    /// declines, and the node is copied verbatim.
    fn refine(&self, _ctx: &mut RefineContext<'_>) -> Result<bool, ModelError> {
        Ok(false)
    }

    /// Initial per-instance state, for stateful (recurrent, accumulating,
    /// source) nodes. Stateless nodes return `None`.
    fn initial_state(&self) -> Option<Tensor> {
        None
    }

    /// Reference semantics: computes output tensors from input tensors and,
    /// for stateful nodes, the mutable state.
    fn compute(
        &self,
        inputs: &[&Tensor],
        state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError>;

    /// Writes the node's parameters into an archive.
    fn archive(&self, writer: &mut ArchiveWriter);

    /// Upcast for capability probing.
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn Node> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl std::fmt::Debug for dyn Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({})", self.type_name())
    }
}

/// Downcasts a node to a concrete type.
pub fn node_as<T: Node>(node: &dyn Node) -> Option<&T> {
    node.as_any().downcast_ref::<T>()
}
