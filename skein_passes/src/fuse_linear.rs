//! Fusion of adjacent broadcast linear operations.

use tracing::debug;

use skein_model::{
    Model, ModelError, OutputPortRef, Submodel, TransformContext, Transformation, Transformer,
    node_as, transform_node_local,
};
use skein_nodes::BroadcastLinearNode;

/// Collapses chains of broadcast linear nodes along the same axis into a
/// single node with composed coefficients:
/// `(a₂, b₂) ∘ (a₁, b₁) = (a₂·a₁, a₂·b₁ + b₂)`.
///
/// When a fused node is emitted, the downstream node's output is remapped
/// onto it and the upstream copy goes dead; the driver's prune removes it.
/// Chains longer than two shrink by one link per application and converge
/// under the driver's repetition.
#[derive(Debug, Default)]
pub struct FuseLinearOperations;

impl Transformation for FuseLinearOperations {
    fn name(&self) -> &'static str {
        "fuse_linear_operations"
    }

    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError> {
        transform_node_local(submodel, source_model, transformer, ctx, |model, id, transformer, _| {
            let fusable = node_as::<BroadcastLinearNode>(model.node(id)).and_then(|second| {
                let [input] = model.inputs(id) else {
                    return None;
                };
                let source = input.source;
                let first = node_as::<BroadcastLinearNode>(model.node(source.node))?;
                if model.consumers(source).len() != 1
                    || first.axis() != second.axis()
                    || first.input_shape() != second.input_shape()
                {
                    return None;
                }
                Some((source.node, first.fuse_after(second)))
            });
            match fusable {
                Some((upstream, fused)) => {
                    let fused = fused?;
                    debug!(?id, "fusing linear chain");
                    let inputs = transformer.corresponding_inputs(model, upstream)?;
                    let dest = transformer.add_node(fused, &inputs)?;
                    transformer.map_output(
                        OutputPortRef { node: id, port: 0 },
                        OutputPortRef { node: dest, port: 0 },
                    );
                    Ok(())
                }
                None => transformer.copy_node(model, id).map(|_| ()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::Evaluator;
    use skein_nodes::InputNode;
    use skein_value::{ElementType, Tensor};

    fn linear(scale: f32, bias: f32, len: usize) -> BroadcastLinearNode {
        BroadcastLinearNode::new(
            Tensor::from_vec(vec![scale; len]),
            Tensor::from_vec(vec![bias; len]),
            0,
            &[len],
        )
        .unwrap()
    }

    #[test]
    fn chain_of_two_becomes_one_node() {
        let mut model = Model::new();
        let input = model.add_node(InputNode::new(ElementType::F32, &[4]), &[]).unwrap();
        let first = model
            .add_node(linear(2.0, 1.0, 4), &[OutputPortRef { node: input, port: 0 }])
            .unwrap();
        let second = model
            .add_node(linear(3.0, 0.0, 4), &[OutputPortRef { node: first, port: 0 }])
            .unwrap();

        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (fused_model, fused_submodel) =
            FuseLinearOperations.apply(&model, &submodel, &ctx).unwrap();

        // input + one fused linear node.
        assert_eq!(2, fused_model.len());
        let fused_id = fused_model.iter().last().unwrap();
        let fused = node_as::<BroadcastLinearNode>(fused_model.node(fused_id)).unwrap();
        assert_eq!(Some(vec![6.0f32; 4]), fused.scale().to_vec::<f32>());
        assert_eq!(Some(vec![3.0f32; 4]), fused.bias().to_vec::<f32>());

        // Same function: 3·(2x + 1) = 6x + 3.
        let mut eval = Evaluator::new();
        let fused_input = fused_model.iter().next().unwrap();
        eval.set_state(
            &fused_model,
            fused_input,
            Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]),
        )
        .unwrap();
        eval.run(&fused_model).unwrap();
        assert_eq!(
            Some(vec![9.0f32, 15.0, 21.0, 27.0]),
            eval.value(fused_submodel.outputs[0]).unwrap().to_vec::<f32>()
        );
        let _ = second;
    }

    #[test]
    fn shared_intermediates_are_not_fused() {
        let mut model = Model::new();
        let input = model.add_node(InputNode::new(ElementType::F32, &[2]), &[]).unwrap();
        let first = model
            .add_node(linear(2.0, 0.0, 2), &[OutputPortRef { node: input, port: 0 }])
            .unwrap();
        // Two consumers of `first`: fusing would change the shared value.
        let _second = model
            .add_node(linear(3.0, 0.0, 2), &[OutputPortRef { node: first, port: 0 }])
            .unwrap();
        let _third = model
            .add_node(linear(4.0, 0.0, 2), &[OutputPortRef { node: first, port: 0 }])
            .unwrap();

        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (out_model, _) = FuseLinearOperations.apply(&model, &submodel, &ctx).unwrap();
        assert_eq!(4, out_model.len());
    }
}
