//! End-to-end compilation scenarios: build a map, compile it, drive the
//! artifact through its invocation surface, and check the observable
//! values.

use skein_compiler::{CompileError, ENTRY_SYMBOL, MapCompiler};
use skein_model::{Map, Model, ModelError, NodeId, OutputPortRef};
use skein_nodes::{
    AccumulatorNode, BroadcastLinearNode, ConstantNode, InputNode, MatrixVectorProductNode,
    OutputNode, ReorderDataNode, SinkNode, SumNode, WindowKind, WindowNode,
};
use skein_value::{DimensionOrder, ElementType, MemoryLayout, Tensor};

fn port(node: NodeId, port: usize) -> OutputPortRef {
    OutputPortRef { node, port }
}

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
fn two_constant_sum() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[3]), &[]).unwrap();
    let sum = model.add_node(SumNode::new(ElementType::F32), &[port(input, 0)]).unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[1]), &[port(sum, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled
        .set_input("in", &Tensor::from_vec(vec![1.0f32, 2.0, 3.0]))
        .unwrap();
    compiled.compute().unwrap();
    assert_eq!(
        Some(vec![6.0f32]),
        compiled.get_output("out").unwrap().to_vec::<f32>()
    );
}

#[test]
fn accumulator_pair_keeps_running_sums() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[3]), &[]).unwrap();
    let first = model
        .add_node(AccumulatorNode::new(ElementType::F32, &[3]), &[port(input, 0)])
        .unwrap();
    let second = model
        .add_node(AccumulatorNode::new(ElementType::F32, &[3]), &[port(first, 0)])
        .unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[3]), &[port(second, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    let frames = [
        vec![1.0f32, 2.0, 3.0],
        vec![4.0, 5.0, 6.0],
        vec![7.0, 8.0, 9.0],
    ];
    let mut last = Vec::new();
    for frame in frames {
        compiled.set_input("in", &Tensor::from_vec(frame)).unwrap();
        compiled.compute().unwrap();
        last = compiled.get_output("out").unwrap().to_vec::<f32>().unwrap();
    }
    // First accumulator after three frames: [12, 15, 18]; the second
    // accumulates its outputs [1,2,3], [5,7,9], [12,15,18].
    assert_eq!(vec![18.0f32, 24.0, 30.0], last);
}

#[test]
fn fused_linear_chain_computes_the_composition() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[4]), &[]).unwrap();
    let first = model.add_node(linear(2.0, 1.0, 4), &[port(input, 0)]).unwrap();
    let second = model.add_node(linear(3.0, 0.0, 4), &[port(first, 0)]).unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[4]), &[port(second, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled
        .set_input("in", &Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0]))
        .unwrap();
    compiled.compute().unwrap();
    assert_eq!(
        Some(vec![9.0f32, 15.0, 21.0, 27.0]),
        compiled.get_output("out").unwrap().to_vec::<f32>()
    );
}

#[test]
fn cancelling_reorders_round_trip_the_data() {
    let mut model = Model::new();
    let input = model
        .add_node(InputNode::new(ElementType::F32, &[2, 3, 4]), &[])
        .unwrap();
    let first = model
        .add_node(
            ReorderDataNode::new(
                skein_model::PortSpec::shaped(ElementType::F32, &[2, 3, 4]),
                DimensionOrder::new(vec![2, 0, 1]).unwrap(),
            )
            .unwrap(),
            &[port(input, 0)],
        )
        .unwrap();
    let second = model
        .add_node(
            ReorderDataNode::new(
                skein_model::PortSpec::shaped(ElementType::F32, &[4, 2, 3]),
                DimensionOrder::new(vec![1, 2, 0]).unwrap(),
            )
            .unwrap(),
            &[port(first, 0)],
        )
        .unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[2, 3, 4]), &[port(second, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let values: Vec<f32> = (0..24).map(|x| x as f32 * 0.5).collect();
    let mut tensor = Tensor::zeros(ElementType::F32, MemoryLayout::canonical(&[2, 3, 4]));
    tensor.fill_from(&values).unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled.set_input("in", &tensor).unwrap();
    compiled.compute().unwrap();
    assert_eq!(
        Some(values),
        compiled.get_output("out").unwrap().to_vec::<f32>()
    );
}

#[test]
fn window_refines_and_compiles() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F64, &[8]), &[]).unwrap();
    let window = model
        .add_node(
            WindowNode::new(WindowKind::Hamming, ElementType::F64, 8),
            &[port(input, 0)],
        )
        .unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F64, &[8]), &[port(window, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    // Reference semantics through the uncompiled runner.
    let frame: Vec<f64> = (0..8).map(|x| x as f64 - 3.5).collect();
    let mut runner = map.runner();
    runner.set_input("in", Tensor::from_vec(frame.clone())).unwrap();
    runner.compute().unwrap();
    let expected = runner.get_output("out").unwrap().to_vec::<f64>().unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled.set_input("in", &Tensor::from_vec(frame)).unwrap();
    compiled.compute().unwrap();
    let actual = compiled.get_output("out").unwrap().to_vec::<f64>().unwrap();
    for (a, e) in actual.iter().zip(&expected) {
        assert!((a - e).abs() < 1e-12, "{a} != {e}");
    }
}

#[test]
fn matmul_compiles_through_the_loop_nest() {
    let mut model = Model::new();
    let mut matrix = Tensor::zeros(ElementType::F32, MemoryLayout::canonical(&[3, 5]));
    let weights: Vec<f32> = (0..15).map(|x| (x as f32) * 0.25 - 1.0).collect();
    matrix.fill_from(&weights).unwrap();

    let input = model.add_node(InputNode::new(ElementType::F32, &[5]), &[]).unwrap();
    let constants = model.add_node(ConstantNode::new(matrix), &[]).unwrap();
    let product = model
        .add_node(
            MatrixVectorProductNode::new(ElementType::F32, 3, 5),
            &[port(constants, 0), port(input, 0)],
        )
        .unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[3]), &[port(product, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("x".to_owned(), input)],
        vec![("y".to_owned(), port(out, 0))],
    )
    .unwrap();

    let x = vec![1.0f32, -2.0, 0.5, 3.0, 2.0];
    let mut expected = vec![0.0f32; 3];
    for (r, slot) in expected.iter_mut().enumerate() {
        *slot = (0..5).map(|c| weights[r * 5 + c] * x[c]).sum();
    }

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled.set_input("x", &Tensor::from_vec(x)).unwrap();
    compiled.compute().unwrap();
    let actual = compiled.get_output("y").unwrap().to_vec::<f32>().unwrap();
    for (a, e) in actual.iter().zip(&expected) {
        assert!((a - e).abs() < 1e-4, "{a} != {e}");
    }
}

#[test]
fn sink_callbacks_observe_the_stream() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[2]), &[]).unwrap();
    let doubled = model.add_node(linear(2.0, 0.0, 2), &[port(input, 0)]).unwrap();
    let sink = model
        .add_node(
            SinkNode::new(ElementType::F32, &[2], "on_frame"),
            &[port(doubled, 0)],
        )
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(sink, 0))],
    )
    .unwrap();

    let seen: Rc<RefCell<Vec<f32>>> = Rc::new(RefCell::new(Vec::new()));
    let seen_by_callback = Rc::clone(&seen);

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled.bind_callback(
        "on_frame",
        Box::new(move |args| {
            let skein_value::backend::interp::HostArg::Memory(buffer, offset) = &args[0] else {
                return Err("expected a buffer".to_owned());
            };
            let values = buffer.to_vec::<f32>().ok_or("expected f32")?;
            seen_by_callback.borrow_mut().extend(&values[*offset..]);
            Ok(None)
        }),
    );
    compiled
        .set_input("in", &Tensor::from_vec(vec![1.5f32, -2.0]))
        .unwrap();
    compiled.compute().unwrap();
    assert_eq!(vec![3.0f32, -4.0], *seen.borrow());
}

#[test]
fn entry_function_resolves_for_direct_invocation() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[1]), &[]).unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[1]), &[port(input, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let mut compiled = MapCompiler::new().compile(&map).unwrap();
    compiled
        .set_input("in", &Tensor::from_vec(vec![42.0f32]))
        .unwrap();
    let mut entry = compiled.resolve_function(ENTRY_SYMBOL).unwrap();
    entry.call(&[]).unwrap();
    assert_eq!(
        Some(vec![42.0f32]),
        compiled.get_output("out").unwrap().to_vec::<f32>()
    );
    assert!(compiled.resolve_function("no_such_symbol").is_none());
}

#[test]
fn set_input_checks_type_and_size() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[2]), &[]).unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[2]), &[port(input, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();
    let mut compiled = MapCompiler::new().compile(&map).unwrap();

    let wrong_type = Tensor::from_vec(vec![1.0f64, 2.0]);
    assert!(compiled.set_input("in", &wrong_type).is_err());
    let wrong_size = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
    assert!(compiled.set_input("in", &wrong_size).is_err());
    let wrong_name = Tensor::from_vec(vec![1.0f32, 2.0]);
    assert!(compiled.set_input("missing", &wrong_name).is_err());
}

/// A node with neither a refine nor a compile capability.
#[derive(Clone)]
struct OpaqueNode;

impl skein_model::Node for OpaqueNode {
    fn type_name(&self) -> &'static str {
        "opaque"
    }
    fn output_specs(&self) -> Vec<skein_model::PortSpec> {
        vec![skein_model::PortSpec::vector(ElementType::F32, 1)]
    }
    fn validate_inputs(&self, _inputs: &[skein_model::PortSpec]) -> Result<(), ModelError> {
        Ok(())
    }
    fn clone_box(&self) -> Box<dyn skein_model::Node> {
        Box::new(self.clone())
    }
    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        Ok(vec![inputs[0].clone()])
    }
    fn archive(&self, _writer: &mut skein_model::ArchiveWriter) {}
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[test]
fn unrefinable_nodes_surface_the_refinement_loop_error() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[1]), &[]).unwrap();
    let opaque = model.add_node(OpaqueNode, &[port(input, 0)]).unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(opaque, 0))],
    )
    .unwrap();

    let result = MapCompiler::new().compile(&map);
    assert!(matches!(
        result,
        Err(CompileError::Model(ModelError::RefinementLoop { .. }))
    ));
}

#[test]
fn rendered_rust_source_is_parseable() {
    let mut model = Model::new();
    let input = model.add_node(InputNode::new(ElementType::F32, &[3]), &[]).unwrap();
    let sum = model.add_node(SumNode::new(ElementType::F32), &[port(input, 0)]).unwrap();
    let out = model
        .add_node(OutputNode::new(ElementType::F32, &[1]), &[port(sum, 0)])
        .unwrap();
    let map = Map::new(
        model,
        vec![("in".to_owned(), input)],
        vec![("out".to_owned(), port(out, 0))],
    )
    .unwrap();

    let source = MapCompiler::new().render_rust_source(&map).unwrap();
    assert!(source.contains("pub struct Memory"));
    assert!(source.contains("pub fn compute"));
}
