//! The settable input node: where values enter a map.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at};

/// A source node whose value is supplied by the caller before each compute.
/// The settable buffer is the node's state; maps bind their named inputs to
/// nodes of this type.
#[derive(Clone)]
pub struct InputNode {
    spec: PortSpec,
}

impl InputNode {
    /// An input producing canonical tensors of the given shape.
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

impl Node for InputNode {
    fn type_name(&self) -> &'static str {
        "input"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        if inputs.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidGraph("input nodes take no inputs".to_owned()))
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let state = io.state.as_ref().ok_or(EmitError::CapabilityAbsent {
            operation: "compile",
            detail: "input node compiled without a state buffer".to_owned(),
        })?;
        for_each_index(fx, self.spec.layout.active(), &mut |fx, indices| {
            let value = load_at(fx, state, indices)?;
            store_at(fx, &io.outputs[0], indices, value)
        })
    }

    fn initial_state(&self) -> Option<Tensor> {
        Some(Tensor::zeros(self.spec.ty, self.spec.layout.canonicalized()))
    }

    fn compute(
        &self,
        _inputs: &[&Tensor],
        state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let state = state.ok_or_else(|| {
            ModelError::InvalidGraph("input node computed without state".to_owned())
        })?;
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
    fn echoes_its_state() {
        let node = InputNode::new(ElementType::F32, &[3]);
        let mut state = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
        let out = node.compute(&[], Some(&mut state)).unwrap();
        assert_eq!(Some(vec![1.0f32, 2.0, 3.0]), out[0].to_vec::<f32>());
    }
}
