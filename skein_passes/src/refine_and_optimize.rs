//! The driver: alternate refinement with the optimizing transformations.

use tracing::info;

use skein_model::{
    Model, ModelError, RefineTransformation, Submodel, TransformContext, Transformation,
    TransformationRegistry,
};

/// How many refine/optimize rounds the driver runs. Refinement exposes new
/// fusion and reorder opportunities and fusion exposes new refinement
/// opportunities, so a single round is not enough.
const ROUNDS: usize = 2;

/// Refines the model to fixpoint, then alternates the registered
/// transformations with refinement for a fixed number of rounds.
pub fn refine_and_optimize(
    model: &Model,
    submodel: &Submodel,
    registry: &TransformationRegistry,
    ctx: &TransformContext,
) -> Result<(Model, Submodel), ModelError> {
    info!("refining the model");
    let refine = RefineTransformation::new();
    let (mut current_model, mut current_submodel) = refine.apply(model, submodel, ctx)?;

    for round in 0..ROUNDS {
        info!(round, "optimizing the model");
        let (next_model, next_submodel) =
            registry.apply_all(&current_model, &current_submodel, ctx)?;
        current_model = next_model;
        current_submodel = next_submodel;
    }
    Ok((current_model, current_submodel))
}
