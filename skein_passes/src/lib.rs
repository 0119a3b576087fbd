//! The skein compiler's registered graph transformations.
//!
//! The standard registry applies, in order: compiler-option annotation,
//! convolution-method selection, linear-operation fusion, reorder elision,
//! and refinement. [`refine_and_optimize`] drives the registry to fixpoint.

use std::sync::OnceLock;

use skein_model::{RefineTransformation, TransformationRegistry};

pub mod fuse_linear;
pub mod optimize_reorder;
pub mod refine_and_optimize;
pub mod set_compiler_options;
pub mod set_convolution_method;

pub use fuse_linear::FuseLinearOperations;
pub use optimize_reorder::OptimizeReorderData;
pub use refine_and_optimize::refine_and_optimize;
pub use set_compiler_options::{OPTIONS_KEY, SetCompilerOptions};
pub use set_convolution_method::{METHOD_KEY, SetConvolutionMethod};

/// Builds a registry holding the standard transformations in their standard
/// order.
pub fn standard_registry() -> TransformationRegistry {
    let mut registry = TransformationRegistry::new();
    registry.add(SetCompilerOptions::from_context());
    registry.add(SetConvolutionMethod::default());
    registry.add(FuseLinearOperations);
    registry.add(OptimizeReorderData);
    registry.add(RefineTransformation::new());
    registry
}

/// The process-wide registry: built once at first use, read-only thereafter.
/// Callers that need isolation build an instance registry with
/// [`standard_registry`] instead.
pub fn global_registry() -> &'static TransformationRegistry {
    static REGISTRY: OnceLock<TransformationRegistry> = OnceLock::new();
    REGISTRY.get_or_init(standard_registry)
}

#[cfg(test)]
mod tests {
    use skein_model::{
        Model, OutputPortRef, Submodel, TransformContext, node_as,
    };
    use skein_nodes::{InputNode, WindowKind, WindowNode};
    use skein_value::ElementType;

    use super::*;

    #[test]
    fn registry_lists_the_standard_passes_in_order() {
        let names: Vec<&str> = standard_registry().iter().map(|t| t.name()).collect();
        assert_eq!(
            vec![
                "set_compiler_options",
                "set_convolution_method",
                "fuse_linear_operations",
                "optimize_reorder_data",
                "refine"
            ],
            names
        );
    }

    #[test]
    fn driver_lowers_a_window_to_compilable_nodes() {
        let mut model = Model::new();
        let input = model
            .add_node(InputNode::new(ElementType::F32, &[8]), &[])
            .unwrap();
        let _window = model
            .add_node(
                WindowNode::new(WindowKind::Hamming, ElementType::F32, 8),
                &[OutputPortRef { node: input, port: 0 }],
            )
            .unwrap();

        let ctx = TransformContext::default();
        let submodel = Submodel::whole(&model);
        let (lowered, _) =
            refine_and_optimize(&model, &submodel, global_registry(), &ctx).unwrap();

        assert!(ctx.is_model_compilable(&lowered));
        assert!(
            lowered
                .iter()
                .all(|id| node_as::<WindowNode>(lowered.node(id)).is_none())
        );
    }
}
