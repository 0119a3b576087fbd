//! The accumulator node: a running elementwise sum.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Scalar, Tensor};

use crate::codegen::{for_each_index, load_at, store_at, values_f64};

/// Maintains a running sum of everything it has seen; each compute adds the
/// input into the state and emits the updated sum. The state is a mutable
/// module global in compiled artifacts.
#[derive(Clone)]
pub struct AccumulatorNode {
    spec: PortSpec,
}

impl AccumulatorNode {
    /// An accumulator over canonical tensors of the given shape.
    pub fn new(ty: ElementType, shape: &[usize]) -> Self {
        Self {
            spec: PortSpec::shaped(ty, shape),
        }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        let layout: MemoryLayout = reader.get("layout")?;
        Ok(Box::new(Self {
            spec: PortSpec { ty, layout },
        }))
    }
}

impl Node for AccumulatorNode {
    fn type_name(&self) -> &'static str {
        "accumulator"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.spec.ty && one.active_count() == self.spec.active_count() => {
                Ok(())
            }
            [one] if one.ty != self.spec.ty => Err(ModelError::TypeMismatch {
                node: None,
                expected: self.spec.ty,
                actual: one.ty,
            }),
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "accumulator input disagrees with its declared shape".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph("accumulator takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let state = io.state.as_ref().ok_or_else(|| EmitError::CapabilityAbsent {
            operation: "compile",
            detail: "accumulator compiled without a state buffer".to_owned(),
        })?;
        for_each_index(fx, self.spec.layout.active(), &mut |fx, indices| {
            let x = load_at(fx, &io.inputs[0], indices)?;
            let acc = load_at(fx, state, indices)?;
            let next = fx.add(acc, x)?;
            store_at(fx, state, indices, next)?;
            store_at(fx, &io.outputs[0], indices, next)
        })
    }

    fn initial_state(&self) -> Option<Tensor> {
        Some(Tensor::zeros(self.spec.ty, self.spec.layout.canonicalized()))
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let state = state.ok_or_else(|| {
            ModelError::InvalidGraph("accumulator computed without state".to_owned())
        })?;
        let x = values_f64(inputs[0])?;
        let acc = values_f64(state)?;
        let indices: Vec<_> = state.layout().active_indices().collect();
        for ((index, a), b) in indices.into_iter().zip(acc).zip(&x) {
            let next = Scalar::from_f64(self.spec.ty, a + b).expect("numeric element type");
            state.set(&index, next);
        }
        Ok(vec![state.clone()])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.spec.ty);
        writer.set("layout", &self.spec.layout);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_a_running_sum() {
        let node = AccumulatorNode::new(ElementType::F32, &[3]);
        let mut state = node.initial_state().unwrap();
        for (input, expected) in [
            (vec![1.0f32, 2.0, 3.0], vec![1.0f32, 2.0, 3.0]),
            (vec![4.0, 5.0, 6.0], vec![5.0, 7.0, 9.0]),
            (vec![7.0, 8.0, 9.0], vec![12.0, 15.0, 18.0]),
        ] {
            let input = Tensor::from_vec(input);
            let out = node.compute(&[&input], Some(&mut state)).unwrap();
            assert_eq!(Some(expected), out[0].to_vec::<f32>());
        }
    }
}
