//! The skein compiler's standard node library.
//!
//! One module per node type, assembled into the standard node-type registry
//! the same way factories are looked up from archives: by runtime type name.

use std::sync::OnceLock;

use skein_model::NodeRegistry;

mod codegen;

macro_rules! declare_nodes {
    ( $( $mod:ident :: $node:ident => $name:literal, )* ) => {
        $( pub mod $mod; )*

        /// Registers every standard node factory.
        pub fn register_standard_nodes(registry: &mut NodeRegistry) {
            $( registry.register($name, $mod::$node::from_archive); )*
        }

        /// The standard node-type registry, built on first use and read-only
        /// thereafter.
        pub fn node_registry() -> &'static NodeRegistry {
            static REGISTRY: OnceLock<NodeRegistry> = OnceLock::new();
            REGISTRY.get_or_init(|| {
                let mut registry = NodeRegistry::new();
                register_standard_nodes(&mut registry);
                registry
            })
        }
    };
}
declare_nodes![
    accumulator::AccumulatorNode => "accumulator",
    broadcast_linear::BroadcastLinearNode => "broadcast_linear",
    constant::ConstantNode => "constant",
    convolution::ConvolutionNode => "convolution",
    elementwise::BinaryElementwiseNode => "binary_elementwise",
    extremal::ExtremalValueNode => "extremal_value",
    forest::SimpleForestNode => "simple_forest",
    input::InputNode => "input",
    matmul::MatrixVectorProductNode => "matrix_vector_product",
    output::OutputNode => "output",
    reorder::ReorderDataNode => "reorder_data",
    selector::ValueSelectorNode => "value_selector",
    sink::SinkNode => "sink",
    source::SourceNode => "source",
    sum::SumNode => "sum",
    threshold::SingleElementThresholdNode => "single_element_threshold",
    window::WindowNode => "window",
];

pub use accumulator::AccumulatorNode;
pub use broadcast_linear::BroadcastLinearNode;
pub use constant::ConstantNode;
pub use convolution::{ConvolutionMethod, ConvolutionNode};
pub use elementwise::{BinaryElementwiseNode, ElementwiseOp};
pub use extremal::{ExtremalMode, ExtremalValueNode};
pub use forest::{SimpleForestNode, Stump};
pub use input::InputNode;
pub use matmul::MatrixVectorProductNode;
pub use output::OutputNode;
pub use reorder::ReorderDataNode;
pub use selector::ValueSelectorNode;
pub use sink::SinkNode;
pub use source::SourceNode;
pub use sum::SumNode;
pub use threshold::SingleElementThresholdNode;
pub use window::{WindowKind, WindowNode, window_values};

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::archive::{model_from_archive, model_to_archive};
    use skein_model::{Model, OutputPortRef};
    use skein_value::{ElementType, Tensor};

    #[test]
    fn registry_knows_every_standard_node() {
        let registry = node_registry();
        for name in [
            "accumulator",
            "broadcast_linear",
            "constant",
            "convolution",
            "binary_elementwise",
            "extremal_value",
            "simple_forest",
            "input",
            "matrix_vector_product",
            "output",
            "reorder_data",
            "value_selector",
            "sink",
            "source",
            "sum",
            "single_element_threshold",
            "window",
        ] {
            assert!(registry.contains(name), "missing factory for `{name}`");
        }
    }

    #[test]
    fn models_round_trip_through_the_archive() {
        let mut model = Model::new();
        let input = model.add_node(InputNode::new(ElementType::F32, &[3]), &[]).unwrap();
        let constant = model
            .add_node(ConstantNode::new(Tensor::from_vec(vec![2.0f32, 2.0, 2.0])), &[])
            .unwrap();
        let product = model
            .add_node(
                BinaryElementwiseNode::new(ElementwiseOp::Multiply, ElementType::F32, &[3]),
                &[
                    OutputPortRef { node: input, port: 0 },
                    OutputPortRef { node: constant, port: 0 },
                ],
            )
            .unwrap();
        let _sum = model
            .add_node(SumNode::new(ElementType::F32), &[OutputPortRef { node: product, port: 0 }])
            .unwrap();

        let archived = model_to_archive(&model).unwrap();
        let restored = model_from_archive(&archived, node_registry()).unwrap();
        assert_eq!(model.len(), restored.len());

        let mut original = skein_model::Evaluator::new();
        let mut round_tripped = skein_model::Evaluator::new();
        let value = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
        original.set_state(&model, input, value.clone()).unwrap();
        let restored_input = restored.iter().next().unwrap();
        round_tripped
            .set_state(&restored, restored_input, value)
            .unwrap();
        original.run(&model).unwrap();
        round_tripped.run(&restored).unwrap();

        let last = model.iter().last().unwrap();
        let restored_last = restored.iter().last().unwrap();
        assert_eq!(
            original
                .value(OutputPortRef { node: last, port: 0 })
                .unwrap(),
            round_tripped
                .value(OutputPortRef { node: restored_last, port: 0 })
                .unwrap()
        );
    }
}
