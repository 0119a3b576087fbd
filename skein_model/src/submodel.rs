//! Submodels: port-bounded views over a model.

use std::collections::HashSet;

use crate::model::Model;
use crate::port::{InputPortRef, NodeId, OutputPortRef};

/// A view over a model delimited by a set of input ports and a set of
/// output ports: the smallest set of nodes backward-reachable from the
/// outputs, cut off at the inputs. Submodels are the unit passed between
/// transformations.
#[derive(Clone, Debug, Default)]
pub struct Submodel {
    /// Input ports bounding the view from above.
    pub inputs: Vec<InputPortRef>,
    /// Output ports the view produces.
    pub outputs: Vec<OutputPortRef>,
}

impl Submodel {
    /// A view bounded by explicit ports.
    pub fn new(inputs: Vec<InputPortRef>, outputs: Vec<OutputPortRef>) -> Self {
        Self { inputs, outputs }
    }

    /// The view covering a whole model: no bounding inputs, all sink ports
    /// as outputs.
    pub fn whole(model: &Model) -> Self {
        Self {
            inputs: Vec::new(),
            outputs: model.sink_ports(),
        }
    }

    /// The nodes inside the view, in the model's topological order.
    pub fn nodes(&self, model: &Model) -> Vec<NodeId> {
        let boundary: HashSet<NodeId> = self.inputs.iter().map(|p| p.node).collect();
        let mut reachable = HashSet::new();
        let mut stack: Vec<NodeId> = self.outputs.iter().map(|p| p.node).collect();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id) || boundary.contains(&id) {
                continue;
            }
            for input in model.inputs(id) {
                stack.push(input.source.node);
            }
        }
        model.iter().filter(|id| reachable.contains(id)).collect()
    }

    /// Returns true if the node is inside the view.
    pub fn contains(&self, model: &Model, id: NodeId) -> bool {
        self.nodes(model).contains(&id)
    }
}
