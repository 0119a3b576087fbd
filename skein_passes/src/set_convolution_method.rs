//! Convolution-algorithm selection.

use tracing::debug;

use skein_model::{
    Model, ModelError, Submodel, TransformContext, Transformation, Transformer, node_as,
    transform_node_local,
};
use skein_nodes::{ConvolutionMethod, ConvolutionNode};

/// The metadata key the chosen method is recorded under.
pub const METHOD_KEY: &str = "convolution_method";

/// Annotates convolution nodes that are still `automatic` with a concrete
/// algorithm: the preference from the context's extra options when present,
/// otherwise a geometry heuristic (small filters unroll, everything else
/// takes the simple schedule).
#[derive(Debug, Default)]
pub struct SetConvolutionMethod {
    preference: ConvolutionMethod,
}

impl SetConvolutionMethod {
    /// A pass with an explicit preference.
    pub fn new(preference: ConvolutionMethod) -> Self {
        Self { preference }
    }

    fn choose(&self, node: &ConvolutionNode, ctx: &TransformContext) -> ConvolutionMethod {
        let preferred = ctx
            .options
            .extra
            .get::<ConvolutionMethod>(METHOD_KEY)
            .unwrap_or(self.preference);
        if preferred != ConvolutionMethod::Automatic {
            return preferred;
        }
        let [kh, kw] = node.filter_shape();
        if kh * kw <= 9 {
            ConvolutionMethod::Unrolled
        } else {
            ConvolutionMethod::Simple
        }
    }
}

impl Transformation for SetConvolutionMethod {
    fn name(&self) -> &'static str {
        "set_convolution_method"
    }

    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError> {
        transform_node_local(submodel, source_model, transformer, ctx, |model, id, transformer, ctx| {
            let Some(convolution) = node_as::<ConvolutionNode>(model.node(id)) else {
                return transformer.copy_node(model, id).map(|_| ());
            };
            if convolution.method() != ConvolutionMethod::Automatic {
                return transformer.copy_node(model, id).map(|_| ());
            }
            let method = self.choose(convolution, ctx);
            debug!(?id, ?method, "selecting convolution method");
            let inputs = transformer.corresponding_inputs(model, id)?;
            let annotated = convolution.with_method(method);
            let dest = transformer.add_node(annotated, &inputs)?;
            for port in 0..model.outputs(id).len() {
                transformer.map_output(
                    skein_model::OutputPortRef { node: id, port },
                    skein_model::OutputPortRef { node: dest, port },
                );
            }
            transformer
                .dest_mut()
                .node_metadata_mut(dest)
                .set(METHOD_KEY, method);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::{OutputPortRef, PropertyBag};
    use skein_nodes::InputNode;
    use skein_value::ElementType;

    fn conv_model() -> Model {
        let mut model = Model::new();
        let image = model
            .add_node(InputNode::new(ElementType::F32, &[4, 4]), &[])
            .unwrap();
        let filter = model
            .add_node(InputNode::new(ElementType::F32, &[2, 2]), &[])
            .unwrap();
        model
            .add_node(
                ConvolutionNode::new(ElementType::F32, [4, 4], [2, 2]).unwrap(),
                &[
                    OutputPortRef { node: image, port: 0 },
                    OutputPortRef { node: filter, port: 0 },
                ],
            )
            .unwrap();
        model
    }

    #[test]
    fn preference_from_context_wins() {
        let model = conv_model();
        let mut options = skein_model::CompilerOptions::default();
        let mut extra = PropertyBag::new();
        extra.set(METHOD_KEY, ConvolutionMethod::Unrolled);
        options.extra = extra;
        let ctx = TransformContext::new(options);

        let submodel = Submodel::whole(&model);
        let (annotated, _) = SetConvolutionMethod::default()
            .apply(&model, &submodel, &ctx)
            .unwrap();
        let conv_id = annotated.iter().last().unwrap();
        let conv = node_as::<ConvolutionNode>(annotated.node(conv_id)).unwrap();
        assert_eq!(ConvolutionMethod::Unrolled, conv.method());
        assert_eq!(
            Some(ConvolutionMethod::Unrolled),
            annotated.node_metadata(conv_id).get(METHOD_KEY)
        );
    }

    #[test]
    fn automatic_preference_resolves_to_a_concrete_method() {
        let model = conv_model();
        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (annotated, _) = SetConvolutionMethod::default()
            .apply(&model, &submodel, &ctx)
            .unwrap();
        let conv_id = annotated.iter().last().unwrap();
        let conv = node_as::<ConvolutionNode>(annotated.node(conv_id)).unwrap();
        assert_ne!(ConvolutionMethod::Automatic, conv.method());
    }
}
