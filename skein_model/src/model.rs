//! The owning model graph.
//!
//! A `Model` holds its nodes in a slotmap arena and records the insertion
//! order. Because a node's inputs must reference output ports that already
//! exist when the node is added, insertion order is a valid topological
//! order, and iteration in either direction is deterministic given the
//! insertion and connection order.

use std::collections::{HashMap, HashSet, VecDeque};

use slotmap::SlotMap;
use tracing::trace;

use skein_value::Tensor;

use crate::error::ModelError;
use crate::node::Node;
use crate::port::{InputPort, InputPortRef, NodeId, OutputPort, OutputPortRef, PortSpec};
use crate::properties::PropertyBag;

pub(crate) struct NodeEntry {
    pub(crate) node: Box<dyn Node>,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) metadata: PropertyBag,
}

/// A directed acyclic graph of nodes connected by port references.
#[derive(Default)]
pub struct Model {
    nodes: SlotMap<NodeId, NodeEntry>,
    insertion: Vec<NodeId>,
    metadata: PropertyBag,
}

impl Model {
    /// An empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node, connecting its inputs to the given output ports. The
    /// ports must already exist in this model, which keeps the graph acyclic
    /// by construction.
    pub fn add_node<N: Node>(
        &mut self,
        node: N,
        inputs: &[OutputPortRef],
    ) -> Result<NodeId, ModelError> {
        self.add_boxed(Box::new(node), inputs)
    }

    /// [`Model::add_node`] for an already-boxed node.
    pub fn add_boxed(
        &mut self,
        node: Box<dyn Node>,
        inputs: &[OutputPortRef],
    ) -> Result<NodeId, ModelError> {
        let mut input_ports = Vec::with_capacity(inputs.len());
        let mut input_specs = Vec::with_capacity(inputs.len());
        for &source in inputs {
            let spec = self.output_spec(source)?.clone();
            input_specs.push(spec.clone());
            input_ports.push(InputPort { spec, source });
        }
        node.validate_inputs(&input_specs)?;
        let outputs = node
            .output_specs()
            .into_iter()
            .map(|spec| OutputPort {
                spec,
                consumers: Vec::new(),
            })
            .collect();

        let id = self.nodes.insert(NodeEntry {
            node,
            inputs: input_ports,
            outputs,
            metadata: PropertyBag::new(),
        });
        self.insertion.push(id);
        for (port, &source) in inputs.iter().enumerate() {
            self.nodes[source.node].outputs[source.port]
                .consumers
                .push(InputPortRef { node: id, port });
        }
        trace!(node = ?id, ty = self.nodes[id].node.type_name(), "added node");
        Ok(id)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.insertion.len()
    }

    /// Returns true if the model has no nodes.
    pub fn is_empty(&self) -> bool {
        self.insertion.is_empty()
    }

    /// Returns true if the id belongs to this model.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// The node behind an id.
    pub fn node(&self, id: NodeId) -> &dyn Node {
        &*self.nodes[id].node
    }

    /// The node's input ports, in order.
    pub fn inputs(&self, id: NodeId) -> &[InputPort] {
        &self.nodes[id].inputs
    }

    /// The node's output ports, in order.
    pub fn outputs(&self, id: NodeId) -> &[OutputPort] {
        &self.nodes[id].outputs
    }

    /// The spec of an output port.
    pub fn output_spec(&self, port: OutputPortRef) -> Result<&PortSpec, ModelError> {
        let entry = self
            .nodes
            .get(port.node)
            .ok_or_else(|| ModelError::InvalidGraph(format!("dangling node {:?}", port.node)))?;
        entry
            .outputs
            .get(port.port)
            .map(|p| &p.spec)
            .ok_or_else(|| {
                ModelError::InvalidGraph(format!(
                    "node {:?} has no output port {}",
                    port.node, port.port
                ))
            })
    }

    /// The input ports consuming an output port.
    pub fn consumers(&self, port: OutputPortRef) -> &[InputPortRef] {
        &self.nodes[port.node].outputs[port.port].consumers
    }

    /// Node-level metadata.
    pub fn node_metadata(&self, id: NodeId) -> &PropertyBag {
        &self.nodes[id].metadata
    }

    /// Node-level metadata, mutably.
    pub fn node_metadata_mut(&mut self, id: NodeId) -> &mut PropertyBag {
        &mut self.nodes[id].metadata
    }

    /// Model-level metadata.
    pub fn metadata(&self) -> &PropertyBag {
        &self.metadata
    }

    /// Model-level metadata, mutably.
    pub fn metadata_mut(&mut self) -> &mut PropertyBag {
        &mut self.metadata
    }

    /// Iterates nodes in forward topological order: every producer before
    /// any consumer of its outputs.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.insertion.iter().copied()
    }

    /// Iterates nodes in reverse topological order.
    pub fn iter_reverse(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.insertion.iter().rev().copied()
    }

    /// Output ports with no consumers, in topological order.
    pub fn sink_ports(&self) -> Vec<OutputPortRef> {
        let mut out = Vec::new();
        for id in self.iter() {
            for (port, output) in self.nodes[id].outputs.iter().enumerate() {
                if output.consumers.is_empty() {
                    out.push(OutputPortRef { node: id, port });
                }
            }
        }
        out
    }

    /// The set of nodes backward-reachable from the given output ports.
    pub fn reachable_from(&self, outputs: &[OutputPortRef]) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeId> = outputs.iter().map(|p| p.node).collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            for input in &self.nodes[id].inputs {
                queue.push_back(input.source.node);
            }
        }
        seen
    }

    /// Removes every node not backward-reachable from the given outputs.
    pub fn prune(&mut self, outputs: &[OutputPortRef]) {
        let keep = self.reachable_from(outputs);
        let dropped: Vec<NodeId> = self
            .insertion
            .iter()
            .copied()
            .filter(|id| !keep.contains(id))
            .collect();
        if dropped.is_empty() {
            return;
        }
        trace!(count = dropped.len(), "pruning unreachable nodes");
        for id in &dropped {
            self.nodes.remove(*id);
        }
        self.insertion.retain(|id| keep.contains(id));
        for entry in self.nodes.values_mut() {
            for output in &mut entry.outputs {
                output.consumers.retain(|c| keep.contains(&c.node));
            }
        }
    }

    /// Checks the structural invariants: no dangling references, producers
    /// precede consumers, connected specs agree, and the consumer reverse
    /// index is consistent.
    pub fn verify(&self) -> Result<(), ModelError> {
        let mut position = HashMap::new();
        for (i, &id) in self.insertion.iter().enumerate() {
            if !self.nodes.contains_key(id) {
                return Err(ModelError::InvalidGraph(format!(
                    "insertion order lists removed node {id:?}"
                )));
            }
            if position.insert(id, i).is_some() {
                return Err(ModelError::InvalidGraph(format!(
                    "node {id:?} appears twice in insertion order"
                )));
            }
        }
        for (id, entry) in &self.nodes {
            for (port, input) in entry.inputs.iter().enumerate() {
                let source_spec = self.output_spec(input.source)?;
                if position[&input.source.node] >= position[&id] {
                    return Err(ModelError::CycleDetected { node: Some(id) });
                }
                if source_spec.ty != input.spec.ty {
                    return Err(ModelError::TypeMismatch {
                        node: Some(id),
                        expected: input.spec.ty,
                        actual: source_spec.ty,
                    });
                }
                if !source_spec.layout.is_equivalent(&input.spec.layout) {
                    return Err(ModelError::ShapeMismatch {
                        node: Some(id),
                        detail: format!("input {port} disagrees with its producer's layout"),
                    });
                }
                let back = InputPortRef { node: id, port };
                if !self.nodes[input.source.node].outputs[input.source.port]
                    .consumers
                    .contains(&back)
                {
                    return Err(ModelError::InvalidGraph(format!(
                        "consumer index of {:?} is missing {back:?}",
                        input.source
                    )));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut list = f.debug_list();
        for id in self.iter() {
            list.entry(&format_args!("{:?}: {}", id, self.node(id).type_name()));
        }
        list.finish()
    }
}

/// Reference evaluation of a model: runs every node's `compute` in
/// topological order, carrying per-node state across runs.
#[derive(Default)]
pub struct Evaluator {
    port_values: HashMap<OutputPortRef, Tensor>,
    states: HashMap<NodeId, Tensor>,
}

impl Evaluator {
    /// A fresh evaluator with no state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or replaces) a node's state; this is how settable source nodes
    /// receive their values.
    pub fn set_state(
        &mut self,
        model: &Model,
        id: NodeId,
        value: Tensor,
    ) -> Result<(), ModelError> {
        let initial = model.node(id).initial_state().ok_or_else(|| {
            ModelError::InvalidGraph(format!(
                "node {:?} ({}) is stateless",
                id,
                model.node(id).type_name()
            ))
        })?;
        if initial.element_type() != value.element_type() {
            return Err(ModelError::TypeMismatch {
                node: Some(id),
                expected: initial.element_type(),
                actual: value.element_type(),
            });
        }
        if initial.layout().active_count() != value.layout().active_count() {
            return Err(ModelError::ShapeMismatch {
                node: Some(id),
                detail: format!(
                    "state holds {} elements, value holds {}",
                    initial.layout().active_count(),
                    value.layout().active_count()
                ),
            });
        }
        self.states.insert(id, value);
        Ok(())
    }

    /// Runs the model once.
    pub fn run(&mut self, model: &Model) -> Result<(), ModelError> {
        for id in model.iter() {
            let inputs: Vec<&Tensor> = model
                .inputs(id)
                .iter()
                .map(|input| {
                    self.port_values
                        .get(&input.source)
                        .expect("producers run before consumers")
                })
                .collect();
            let node = model.node(id);
            if let Some(initial) = node.initial_state() {
                let state = self.states.entry(id).or_insert(initial);
                let outputs = node.compute(&inputs, Some(state))?;
                drop(inputs);
                self.store_outputs(id, outputs);
            } else {
                let outputs = node.compute(&inputs, None)?;
                drop(inputs);
                self.store_outputs(id, outputs);
            }
        }
        Ok(())
    }

    fn store_outputs(&mut self, id: NodeId, outputs: Vec<Tensor>) {
        for (port, value) in outputs.into_iter().enumerate() {
            self.port_values
                .insert(OutputPortRef { node: id, port }, value);
        }
    }

    /// The value last computed at an output port.
    pub fn value(&self, port: OutputPortRef) -> Option<&Tensor> {
        self.port_values.get(&port)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::ArchiveWriter;
    use crate::port::PortSpec;
    use skein_value::{ElementType, Tensor};

    /// A minimal test node: emits a fixed vector.
    #[derive(Clone)]
    pub(crate) struct Lit(pub Vec<f32>);

    impl Node for Lit {
        fn type_name(&self) -> &'static str {
            "lit"
        }
        fn output_specs(&self) -> Vec<PortSpec> {
            vec![PortSpec::vector(ElementType::F32, self.0.len())]
        }
        fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
            if inputs.is_empty() {
                Ok(())
            } else {
                Err(ModelError::InvalidGraph("lit takes no inputs".to_owned()))
            }
        }
        fn clone_box(&self) -> Box<dyn Node> {
            Box::new(self.clone())
        }
        fn compute(
            &self,
            _inputs: &[&Tensor],
            _state: Option<&mut Tensor>,
        ) -> Result<Vec<Tensor>, ModelError> {
            Ok(vec![Tensor::from_vec(self.0.clone())])
        }
        fn archive(&self, writer: &mut ArchiveWriter) {
            writer.set("values", &self.0);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    /// Adds its two inputs elementwise.
    #[derive(Clone)]
    pub(crate) struct Add2(pub usize);

    impl Node for Add2 {
        fn type_name(&self) -> &'static str {
            "add2"
        }
        fn output_specs(&self) -> Vec<PortSpec> {
            vec![PortSpec::vector(ElementType::F32, self.0)]
        }
        fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
            if inputs.len() != 2 {
                return Err(ModelError::InvalidGraph("add2 takes two inputs".to_owned()));
            }
            for spec in inputs {
                if spec.active_count() != self.0 {
                    return Err(ModelError::ShapeMismatch {
                        node: None,
                        detail: format!("expected {} elements", self.0),
                    });
                }
            }
            Ok(())
        }
        fn clone_box(&self) -> Box<dyn Node> {
            Box::new(self.clone())
        }
        fn compute(
            &self,
            inputs: &[&Tensor],
            _state: Option<&mut Tensor>,
        ) -> Result<Vec<Tensor>, ModelError> {
            let a = inputs[0].to_vec::<f32>().expect("typed above");
            let b = inputs[1].to_vec::<f32>().expect("typed above");
            let sum = a.iter().zip(&b).map(|(x, y)| x + y).collect();
            Ok(vec![Tensor::from_vec(sum)])
        }
        fn archive(&self, writer: &mut ArchiveWriter) {
            writer.set("size", self.0);
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn port(node: NodeId) -> OutputPortRef {
        OutputPortRef { node, port: 0 }
    }

    #[test]
    fn insertion_order_is_topological() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0, 2.0]), &[]).unwrap();
        let b = model.add_node(Lit(vec![3.0, 4.0]), &[]).unwrap();
        let sum = model.add_node(Add2(2), &[port(a), port(b)]).unwrap();
        assert_eq!(vec![a, b, sum], model.iter().collect::<Vec<_>>());
        assert_eq!(vec![sum, b, a], model.iter_reverse().collect::<Vec<_>>());
        model.verify().unwrap();
    }

    #[test]
    fn consumers_are_reverse_indexed() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0]), &[]).unwrap();
        let b = model.add_node(Add2(1), &[port(a), port(a)]).unwrap();
        let consumers = model.consumers(port(a));
        assert_eq!(2, consumers.len());
        assert!(consumers.iter().all(|c| c.node == b));
    }

    #[test]
    fn dangling_references_are_rejected() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0]), &[]).unwrap();
        let bogus = OutputPortRef { node: a, port: 7 };
        assert!(model.add_node(Add2(1), &[port(a), bogus]).is_err());
    }

    #[test]
    fn prune_drops_unreachable_nodes() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0]), &[]).unwrap();
        let _dead = model.add_node(Lit(vec![9.0]), &[]).unwrap();
        let b = model.add_node(Add2(1), &[port(a), port(a)]).unwrap();
        model.prune(&[port(b)]);
        assert_eq!(2, model.len());
        assert!(model.contains(a));
        assert!(model.contains(b));
        model.verify().unwrap();
    }

    #[test]
    fn evaluator_runs_in_order() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0, 2.0]), &[]).unwrap();
        let b = model.add_node(Lit(vec![10.0, 20.0]), &[]).unwrap();
        let sum = model.add_node(Add2(2), &[port(a), port(b)]).unwrap();
        let mut eval = Evaluator::new();
        eval.run(&model).unwrap();
        assert_eq!(
            Some(vec![11.0, 22.0]),
            eval.value(port(sum)).unwrap().to_vec::<f32>()
        );
    }

    #[test]
    fn sink_ports_are_unconsumed_outputs() {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0]), &[]).unwrap();
        let b = model.add_node(Add2(1), &[port(a), port(a)]).unwrap();
        assert_eq!(vec![port(b)], model.sink_ports());
    }
}
