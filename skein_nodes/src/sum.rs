//! The sum-all node.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, Scalar, Tensor};

use crate::codegen::{for_each_index, load_at, values_f64};

/// Sums every active element of its input into a single-element output.
#[derive(Clone)]
pub struct SumNode {
    ty: ElementType,
}

impl SumNode {
    /// A sum over elements of the given numeric type.
    pub fn new(ty: ElementType) -> Self {
        Self { ty }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        Ok(Box::new(Self { ty }))
    }
}

impl Node for SumNode {
    fn type_name(&self) -> &'static str {
        "sum"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec::vector(self.ty, 1)]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.ty => Ok(()),
            [one] => Err(ModelError::TypeMismatch {
                node: None,
                expected: self.ty,
                actual: one.ty,
            }),
            _ => Err(ModelError::InvalidGraph("sum takes one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let zero_idx = fx.literal_index(0);
        let zero = fx.literal(Scalar::zero(self.ty));
        fx.store(io.outputs[0].ptr, zero_idx, zero)?;
        let shape = io.inputs[0].layout.active().to_vec();
        for_each_index(fx, &shape, &mut |fx, indices| {
            let x = load_at(fx, &io.inputs[0], indices)?;
            let zero_idx = fx.literal_index(0);
            let acc = fx.load(io.outputs[0].ptr, zero_idx)?;
            let next = fx.add(acc, x)?;
            fx.store(io.outputs[0].ptr, zero_idx, next)
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let total: f64 = values_f64(inputs[0])?.iter().sum();
        Ok(vec![crate::codegen::tensor_from_f64(self.ty, &[1], &[total])])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.ty);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_all_elements() {
        let node = SumNode::new(ElementType::F32);
        let input = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
        let out = node.compute(&[&input], None).unwrap();
        assert_eq!(Some(vec![6.0f32]), out[0].to_vec::<f32>());
    }
}
