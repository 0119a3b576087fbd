//! Elision and composition of reorder-data nodes.

use tracing::debug;

use skein_model::{
    Model, ModelError, OutputPortRef, Submodel, TransformContext, Transformation, Transformer,
    node_as, transform_node_local,
};
use skein_nodes::ReorderDataNode;

/// Removes reorder nodes whose permutation has no effect and fuses two
/// consecutive reorders into one whose permutation is the composition;
/// compositions that cancel out remove both nodes.
#[derive(Debug, Default)]
pub struct OptimizeReorderData;

impl Transformation for OptimizeReorderData {
    fn name(&self) -> &'static str {
        "optimize_reorder_data"
    }

    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError> {
        transform_node_local(submodel, source_model, transformer, ctx, |model, id, transformer, _| {
            let Some(reorder) = node_as::<ReorderDataNode>(model.node(id)) else {
                return transformer.copy_node(model, id).map(|_| ());
            };
            let source = model.inputs(id)[0].source;

            // An effect-free reorder forwards its input.
            if reorder.is_identity() {
                debug!(?id, "eliding identity reorder");
                let forwarded = transformer.dest_of(source)?;
                transformer.map_output(OutputPortRef { node: id, port: 0 }, forwarded);
                return Ok(());
            }

            // Two consecutive reorders compose into one.
            if let Some(upstream) = node_as::<ReorderDataNode>(model.node(source.node))
                && model.consumers(source).len() == 1
            {
                let composed = upstream.compose_after(reorder)?;
                let upstream_source = model.inputs(source.node)[0].source;
                let forwarded = transformer.dest_of(upstream_source)?;
                if composed.is_identity() {
                    debug!(?id, "cancelling reorder pair");
                    transformer.map_output(OutputPortRef { node: id, port: 0 }, forwarded);
                } else {
                    debug!(?id, "composing reorder pair");
                    let dest = transformer.add_node(composed, &[forwarded])?;
                    transformer.map_output(
                        OutputPortRef { node: id, port: 0 },
                        OutputPortRef { node: dest, port: 0 },
                    );
                }
                return Ok(());
            }

            transformer.copy_node(model, id).map(|_| ())
        })
    }
}
