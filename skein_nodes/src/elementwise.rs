//! Binary elementwise arithmetic nodes.

use std::any::Any;

use serde::{Deserialize, Serialize};

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at, tensor_from_f64, values_f64};

/// The supported elementwise operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementwiseOp {
    /// `a + b`.
    Add,
    /// `a * b`.
    Multiply,
}

/// Applies a binary operation elementwise over two equal-shape inputs.
#[derive(Clone)]
pub struct BinaryElementwiseNode {
    op: ElementwiseOp,
    spec: PortSpec,
}

impl BinaryElementwiseNode {
    /// An elementwise node over canonical tensors of the given shape.
    pub fn new(op: ElementwiseOp, ty: ElementType, shape: &[usize]) -> Self {
        Self {
            op,
            spec: PortSpec::shaped(ty, shape),
        }
    }

    /// The operation.
    pub fn op(&self) -> ElementwiseOp {
        self.op
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let op: ElementwiseOp = reader.get("op")?;
        let ty: ElementType = reader.get("type")?;
        let layout: MemoryLayout = reader.get("layout")?;
        Ok(Box::new(Self {
            op,
            spec: PortSpec { ty, layout },
        }))
    }
}

impl Node for BinaryElementwiseNode {
    fn type_name(&self) -> &'static str {
        "binary_elementwise"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        if inputs.len() != 2 {
            return Err(ModelError::InvalidGraph(
                "binary elementwise nodes take two inputs".to_owned(),
            ));
        }
        for spec in inputs {
            if spec.ty != self.spec.ty {
                return Err(ModelError::TypeMismatch {
                    node: None,
                    expected: self.spec.ty,
                    actual: spec.ty,
                });
            }
            if spec.active_count() != self.spec.active_count() {
                return Err(ModelError::ShapeMismatch {
                    node: None,
                    detail: format!(
                        "expected {} elements, found {}",
                        self.spec.active_count(),
                        spec.active_count()
                    ),
                });
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        let op = self.op;
        for_each_index(fx, self.spec.layout.active(), &mut |fx, indices| {
            let a = load_at(fx, &io.inputs[0], indices)?;
            let b = load_at(fx, &io.inputs[1], indices)?;
            let value = match op {
                ElementwiseOp::Add => fx.add(a, b)?,
                ElementwiseOp::Multiply => fx.mul(a, b)?,
            };
            store_at(fx, &io.outputs[0], indices, value)
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let a = values_f64(inputs[0])?;
        let b = values_f64(inputs[1])?;
        let out: Vec<f64> = a
            .iter()
            .zip(&b)
            .map(|(x, y)| match self.op {
                ElementwiseOp::Add => x + y,
                ElementwiseOp::Multiply => x * y,
            })
            .collect();
        Ok(vec![tensor_from_f64(
            self.spec.ty,
            self.spec.layout.active(),
            &out,
        )])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("op", self.op);
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
    fn multiplies_elementwise() {
        let node = BinaryElementwiseNode::new(ElementwiseOp::Multiply, ElementType::F32, &[3]);
        let a = Tensor::from_vec(vec![1.0f32, 2.0, 3.0]);
        let b = Tensor::from_vec(vec![4.0f32, 5.0, 6.0]);
        let out = node.compute(&[&a, &b], None).unwrap();
        assert_eq!(Some(vec![4.0f32, 10.0, 18.0]), out[0].to_vec::<f32>());
    }
}
