//! Ports: typed, sized endpoints on nodes.
//!
//! An input port references exactly one producing output port; an output
//! port records the set of input ports that consume it. Ports are stored in
//! the model's arena and addressed by `(node, port index)` pairs, so the
//! graph carries no pointer cycles.

use serde::{Deserialize, Serialize};
use slotmap::new_key_type;

use skein_value::{ElementType, MemoryLayout};

new_key_type! {
    /// Stable identifier of a node within a model.
    pub struct NodeId;
}

/// Addresses an output port: the producing node and the port's position in
/// its output list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputPortRef {
    /// The producing node.
    pub node: NodeId,
    /// Output position on that node.
    pub port: usize,
}

/// Addresses an input port: the consuming node and the port's position in
/// its input list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputPortRef {
    /// The consuming node.
    pub node: NodeId,
    /// Input position on that node.
    pub port: usize,
}

/// The type and layout of one port.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Element type flowing through the port.
    pub ty: ElementType,
    /// Memory layout of the port's values.
    pub layout: MemoryLayout,
}

impl PortSpec {
    /// A one-dimensional canonical port.
    pub fn vector(ty: ElementType, len: usize) -> Self {
        Self {
            ty,
            layout: MemoryLayout::vector(len),
        }
    }

    /// A canonical port of the given shape.
    pub fn shaped(ty: ElementType, shape: &[usize]) -> Self {
        Self {
            ty,
            layout: MemoryLayout::canonical(shape),
        }
    }

    /// Number of active elements.
    pub fn active_count(&self) -> usize {
        self.layout.active_count()
    }
}

/// An input endpoint: its resolved spec plus the output port feeding it.
#[derive(Clone, Debug)]
pub struct InputPort {
    /// The port's type and layout, copied from the producer at connect time.
    pub spec: PortSpec,
    /// The output port supplying this input's values.
    pub source: OutputPortRef,
}

/// An output endpoint: its spec plus the reverse index of consumers.
#[derive(Clone, Debug)]
pub struct OutputPort {
    /// The port's type and layout.
    pub spec: PortSpec,
    /// Input ports that reference this output.
    pub consumers: Vec<InputPortRef>,
}
