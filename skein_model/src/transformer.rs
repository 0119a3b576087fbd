//! The transformer: rewrites a source model into a destination model while
//! maintaining the correspondence from source output ports to destination
//! output ports.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::ModelError;
use crate::model::Model;
use crate::node::Node;
use crate::port::{NodeId, OutputPortRef};
use crate::submodel::Submodel;
use crate::transformation::TransformContext;

/// Rewrites a source [`Model`] into a destination [`Model`], node by node.
///
/// The transformer maintains a partial map `µ` from source output ports to
/// destination output ports. `µ` grows monotonically as nodes are visited;
/// the only permitted reassignment is an explicit [`Transformer::map_output`]
/// call, which optimizations use to replace an earlier node's output with a
/// later equivalent.
#[derive(Default)]
pub struct Transformer {
    dest: Model,
    port_map: HashMap<OutputPortRef, OutputPortRef>,
}

impl Transformer {
    /// A transformer with an empty destination model.
    pub fn new() -> Self {
        Self::default()
    }

    /// The destination model under construction.
    pub fn dest(&self) -> &Model {
        &self.dest
    }

    /// The destination model, mutably (for metadata edits during a visit).
    pub fn dest_mut(&mut self) -> &mut Model {
        &mut self.dest
    }

    /// Finishes the rewrite, validating and returning the destination.
    pub fn into_dest(self) -> Result<Model, ModelError> {
        self.dest.verify()?;
        Ok(self.dest)
    }

    /// The destination port corresponding to a source output port. Asking
    /// for a port whose producer has not been visited is the out-of-order
    /// visit error.
    pub fn dest_of(&self, source: OutputPortRef) -> Result<OutputPortRef, ModelError> {
        self.port_map
            .get(&source)
            .copied()
            .ok_or(ModelError::OutOfOrderVisit { node: source.node })
    }

    /// Explicitly records `µ(source) = dest`. Overwriting an existing entry
    /// is deliberate and allowed.
    pub fn map_output(&mut self, source: OutputPortRef, dest: OutputPortRef) {
        trace!(?source, ?dest, "map output");
        self.port_map.insert(source, dest);
    }

    /// The destination ports assigned to the sources of a node's input
    /// ports.
    pub fn corresponding_inputs(
        &self,
        source_model: &Model,
        node: NodeId,
    ) -> Result<Vec<OutputPortRef>, ModelError> {
        source_model
            .inputs(node)
            .iter()
            .map(|input| self.dest_of(input.source))
            .collect()
    }

    /// The destination ports assigned to the given source ports.
    pub fn corresponding_ports(
        &self,
        sources: &[OutputPortRef],
    ) -> Result<Vec<OutputPortRef>, ModelError> {
        sources.iter().map(|&p| self.dest_of(p)).collect()
    }

    /// Clones a source node into the destination, connecting its inputs
    /// through `µ` and recording `µ` for each of its outputs.
    pub fn copy_node(&mut self, source_model: &Model, node: NodeId) -> Result<NodeId, ModelError> {
        let inputs = self.corresponding_inputs(source_model, node)?;
        let cloned = source_model.node(node).clone_box();
        let dest_id = self.dest.add_boxed(cloned, &inputs)?;
        *self.dest.node_metadata_mut(dest_id) = source_model.node_metadata(node).clone();
        for port in 0..source_model.outputs(node).len() {
            self.port_map.insert(
                OutputPortRef { node, port },
                OutputPortRef {
                    node: dest_id,
                    port,
                },
            );
        }
        Ok(dest_id)
    }

    /// Invokes the node's refinement capability. Returns `true` if the node
    /// refined itself into a subgraph; otherwise the node is copied
    /// verbatim. After a successful refinement every output of the source
    /// node must have been mapped.
    pub fn refine_node(
        &mut self,
        source_model: &Model,
        node: NodeId,
        ctx: &TransformContext,
    ) -> Result<bool, ModelError> {
        let dest_inputs = self.corresponding_inputs(source_model, node)?;
        let mut refine_ctx = RefineContext {
            transformer: self,
            source_model,
            node,
            dest_inputs,
            ctx,
        };
        let refined = source_model.node(node).refine(&mut refine_ctx)?;
        if !refined {
            self.copy_node(source_model, node)?;
            return Ok(false);
        }
        for port in 0..source_model.outputs(node).len() {
            if !self.port_map.contains_key(&OutputPortRef { node, port }) {
                return Err(ModelError::InvalidGraph(format!(
                    "`{}` refined without mapping output {port}",
                    source_model.node(node).type_name()
                )));
            }
        }
        debug!(ty = source_model.node(node).type_name(), "refined node");
        Ok(true)
    }

    /// Adds a destination-side node directly. Its outputs are not recorded
    /// in `µ` unless the caller maps them explicitly.
    pub fn add_node<N: Node>(
        &mut self,
        node: N,
        inputs: &[OutputPortRef],
    ) -> Result<NodeId, ModelError> {
        self.dest.add_node(node, inputs)
    }

    /// Runs a whole rewrite: visits every source node in topological order
    /// under the given visit function, then validates the destination.
    pub fn run<F>(
        &mut self,
        source_model: &Model,
        ctx: &TransformContext,
        mut visit: F,
    ) -> Result<(), ModelError>
    where
        F: FnMut(&Model, NodeId, &mut Transformer, &TransformContext) -> Result<(), ModelError>,
    {
        for node in source_model.iter() {
            visit(source_model, node, self, ctx)?;
        }
        self.dest.verify()?;
        Ok(())
    }

    /// Remaps a submodel's outputs through `µ`.
    pub fn map_submodel(&self, submodel: &Submodel) -> Result<Submodel, ModelError> {
        Ok(Submodel {
            inputs: Vec::new(),
            outputs: self.corresponding_ports(&submodel.outputs)?,
        })
    }
}

/// The context handed to a node's `refine` implementation: the destination
/// side of the transformer, scoped to the node being refined.
pub struct RefineContext<'a> {
    transformer: &'a mut Transformer,
    source_model: &'a Model,
    node: NodeId,
    dest_inputs: Vec<OutputPortRef>,
    ctx: &'a TransformContext,
}

impl RefineContext<'_> {
    /// The destination port feeding the node's `i`-th input.
    pub fn input(&self, i: usize) -> OutputPortRef {
        self.dest_inputs[i]
    }

    /// All destination input ports, in order.
    pub fn inputs(&self) -> &[OutputPortRef] {
        &self.dest_inputs
    }

    /// The source node's metadata.
    pub fn metadata(&self) -> &crate::properties::PropertyBag {
        self.source_model.node_metadata(self.node)
    }

    /// The transform context (options, compilability predicate).
    pub fn context(&self) -> &TransformContext {
        self.ctx
    }

    /// Adds a node to the destination subgraph.
    pub fn add_node<N: Node>(
        &mut self,
        node: N,
        inputs: &[OutputPortRef],
    ) -> Result<NodeId, ModelError> {
        self.transformer.add_node(node, inputs)
    }

    /// Maps the refined node's `port`-th output to a destination port.
    pub fn map_output(&mut self, port: usize, dest: OutputPortRef) {
        self.transformer
            .map_output(OutputPortRef {
                node: self.node,
                port,
            }, dest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{Add2, Lit};
    use crate::port::OutputPortRef;

    fn port(node: NodeId) -> OutputPortRef {
        OutputPortRef { node, port: 0 }
    }

    fn diamond() -> (Model, NodeId) {
        let mut model = Model::new();
        let a = model.add_node(Lit(vec![1.0, 2.0]), &[]).unwrap();
        let b = model.add_node(Lit(vec![3.0, 4.0]), &[]).unwrap();
        let sum = model.add_node(Add2(2), &[port(a), port(b)]).unwrap();
        let out = model.add_node(Add2(2), &[port(sum), port(sum)]).unwrap();
        (model, out)
    }

    #[test]
    fn identity_visit_reproduces_the_model() {
        let (model, out) = diamond();
        let ctx = TransformContext::default();
        let mut transformer = Transformer::new();
        transformer
            .run(&model, &ctx, |m, id, t, _| {
                t.copy_node(m, id).map(|_| ())
            })
            .unwrap();
        let mapped_out = transformer.dest_of(port(out)).unwrap();
        let dest = transformer.into_dest().unwrap();
        assert_eq!(model.len(), dest.len());

        let mut source_eval = crate::model::Evaluator::new();
        source_eval.run(&model).unwrap();
        let mut dest_eval = crate::model::Evaluator::new();
        dest_eval.run(&dest).unwrap();
        assert_eq!(
            source_eval.value(port(out)).unwrap(),
            dest_eval.value(mapped_out).unwrap()
        );
    }

    #[test]
    fn out_of_order_visit_is_an_error() {
        let (model, out) = diamond();
        let transformer = Transformer::new();
        assert!(matches!(
            transformer.dest_of(port(out)),
            Err(ModelError::OutOfOrderVisit { .. })
        ));
        // Visiting a consumer before its producer trips the same error.
        let ctx = TransformContext::default();
        let mut transformer = Transformer::new();
        let result = transformer.run(&model, &ctx, |m, id, t, _| {
            if m.inputs(id).is_empty() {
                Ok(()) // skip sources, so consumers cannot resolve them
            } else {
                t.copy_node(m, id).map(|_| ())
            }
        });
        assert!(matches!(result, Err(ModelError::OutOfOrderVisit { .. })));
    }

    #[test]
    fn map_output_overwrites_deliberately() {
        let (model, _) = diamond();
        let ctx = TransformContext::default();
        let mut transformer = Transformer::new();
        let first = model.iter().next().unwrap();
        transformer.copy_node(&model, first).unwrap();
        let replacement = transformer.add_node(Lit(vec![9.0, 9.0]), &[]).unwrap();
        transformer.map_output(port(first), port(replacement));
        assert_eq!(port(replacement), transformer.dest_of(port(first)).unwrap());
        let _ = ctx;
    }
}
