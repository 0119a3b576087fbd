//! The refinement transformation: lower nodes to more primitive subgraphs,
//! iterating to fixpoint.

use tracing::debug;

use crate::error::ModelError;
use crate::model::Model;
use crate::submodel::Submodel;
use crate::transformation::{TransformContext, Transformation};
use crate::transformer::Transformer;

/// Refines every refinable node in the submodel, repeating until every node
/// is compilable, nothing changed, or the iteration bound is reached.
pub struct RefineTransformation {
    max_iterations: usize,
}

impl RefineTransformation {
    /// A refinement pass with the default iteration bound.
    pub fn new() -> Self {
        Self { max_iterations: 10 }
    }

    /// A refinement pass with an explicit iteration bound.
    pub fn with_max_iterations(max_iterations: usize) -> Self {
        Self { max_iterations }
    }
}

impl Default for RefineTransformation {
    fn default() -> Self {
        Self::new()
    }
}

impl Transformation for RefineTransformation {
    fn name(&self) -> &'static str {
        "refine"
    }

    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError> {
        transformer.run(source_model, ctx, |model, id, transformer, ctx| {
            transformer.refine_node(model, id, ctx).map(|_| ())
        })?;
        transformer.map_submodel(submodel)
    }

    fn apply(
        &self,
        model: &Model,
        submodel: &Submodel,
        ctx: &TransformContext,
    ) -> Result<(Model, Submodel), ModelError> {
        let bound = ctx
            .options
            .max_refinement_iterations
            .min(self.max_iterations)
            .max(1);
        let mut current_model = None;
        let mut current_submodel = submodel.clone();
        for iteration in 0..bound {
            let source = current_model.as_ref().unwrap_or(model);

            let mut refined_any = false;
            let mut transformer = Transformer::new();
            let next_submodel = {
                let refined_any = &mut refined_any;
                transformer.run(source, ctx, |model, id, transformer, ctx| {
                    *refined_any |= transformer.refine_node(model, id, ctx)?;
                    Ok(())
                })?;
                transformer.map_submodel(&current_submodel)?
            };
            let mut next_model = transformer.into_dest()?;
            next_model.prune(&next_submodel.outputs);

            let compilable = ctx.is_model_compilable(&next_model);
            debug!(iteration, refined_any, compilable, "refinement pass");
            current_model = Some(next_model);
            current_submodel = next_submodel;
            if !refined_any || compilable {
                break;
            }
        }
        Ok((
            current_model.expect("at least one refinement iteration runs"),
            current_submodel,
        ))
    }
}
