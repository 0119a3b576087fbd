//! Metadata annotation from a compiler-options property bag.

use skein_model::{
    Model, ModelError, PropertyBag, Submodel, TransformContext, Transformation, Transformer,
};

/// The metadata key options are stored under, on the model and on nodes.
pub const OPTIONS_KEY: &str = "compiler_options";

/// Copies a property bag into model- and node-level metadata without
/// restructuring the graph.
///
/// The bag's schema is `{ "model": <options>, "nodes": { "<index>":
/// <options>, … } }`, where node indices are topological positions; either
/// section may be absent. When constructed without an explicit bag, the
/// options come from the transform context's extras.
#[derive(Debug, Default)]
pub struct SetCompilerOptions {
    options: Option<PropertyBag>,
}

impl SetCompilerOptions {
    /// Annotates from the context's extra options at transform time.
    pub fn from_context() -> Self {
        Self { options: None }
    }

    /// Annotates from an explicit bag.
    pub fn new(options: PropertyBag) -> Self {
        Self {
            options: Some(options),
        }
    }

    fn bag<'a>(&'a self, ctx: &'a TransformContext) -> &'a PropertyBag {
        self.options.as_ref().unwrap_or(&ctx.options.extra)
    }
}

impl Transformation for SetCompilerOptions {
    fn name(&self) -> &'static str {
        "set_compiler_options"
    }

    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError> {
        transformer.run(source_model, ctx, |model, id, transformer, _| {
            transformer.copy_node(model, id).map(|_| ())
        })?;

        let bag = self.bag(ctx);
        if let Some(model_options) = bag.get::<PropertyBag>("model") {
            transformer
                .dest_mut()
                .metadata_mut()
                .set(OPTIONS_KEY, &model_options);
        }
        if let Some(node_options) = bag.get::<serde_json::Map<String, serde_json::Value>>("nodes") {
            let ids: Vec<_> = transformer.dest().iter().collect();
            for (key, value) in node_options {
                let index: usize = key.parse().map_err(|_| {
                    ModelError::InvalidGraph(format!("node options key `{key}` is not an index"))
                })?;
                let id = ids.get(index).copied().ok_or_else(|| {
                    ModelError::InvalidGraph(format!("node options index {index} out of range"))
                })?;
                let options: PropertyBag = serde_json::from_value(value).map_err(|e| {
                    ModelError::ArchiveMismatch(format!("node options for `{key}`: {e}"))
                })?;
                transformer
                    .dest_mut()
                    .node_metadata_mut(id)
                    .set(OPTIONS_KEY, &options);
            }
        }
        transformer.map_submodel(submodel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_nodes::InputNode;
    use skein_value::ElementType;

    #[test]
    fn annotates_model_and_nodes() {
        let mut model = Model::new();
        model.add_node(InputNode::new(ElementType::F32, &[1]), &[]).unwrap();

        let mut per_node = PropertyBag::new();
        per_node.set("unroll", true);
        let mut model_options = PropertyBag::new();
        model_options.set("optimize", "aggressive");
        let mut bag = PropertyBag::new();
        bag.set("model", &model_options);
        bag.set("nodes", serde_json::json!({ "0": per_node }));

        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (annotated, _) = SetCompilerOptions::new(bag)
            .apply(&model, &submodel, &ctx)
            .unwrap();

        let stored: PropertyBag = annotated.metadata().get(OPTIONS_KEY).unwrap();
        assert_eq!(Some("aggressive".to_owned()), stored.get("optimize"));
        let node = annotated.iter().next().unwrap();
        let stored: PropertyBag = annotated.node_metadata(node).get(OPTIONS_KEY).unwrap();
        assert_eq!(Some(true), stored.get("unroll"));
    }

    #[test]
    fn empty_bag_is_a_no_op() {
        let mut model = Model::new();
        model.add_node(InputNode::new(ElementType::F32, &[1]), &[]).unwrap();
        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (annotated, _) = SetCompilerOptions::from_context()
            .apply(&model, &submodel, &ctx)
            .unwrap();
        assert!(annotated.metadata().is_empty());
    }
}
