//! The value selector node.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at};

/// Selects between two equal-shape inputs on a boolean condition: the
/// output is the second input when the condition holds, the third
/// otherwise.
#[derive(Clone)]
pub struct ValueSelectorNode {
    spec: PortSpec,
}

impl ValueSelectorNode {
    /// A selector over canonical tensors of the given shape.
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

impl Node for ValueSelectorNode {
    fn type_name(&self) -> &'static str {
        "value_selector"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        let [condition, if_true, if_false] = inputs else {
            return Err(ModelError::InvalidGraph(
                "selector takes a condition and two values".to_owned(),
            ));
        };
        if condition.ty != ElementType::Bool || condition.active_count() != 1 {
            return Err(ModelError::TypeMismatch {
                node: None,
                expected: ElementType::Bool,
                actual: condition.ty,
            });
        }
        for spec in [if_true, if_false] {
            if spec.ty != self.spec.ty || spec.active_count() != self.spec.active_count() {
                return Err(ModelError::ShapeMismatch {
                    node: None,
                    detail: "selector branches disagree with the declared shape".to_owned(),
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
        let zero = fx.literal_index(0);
        let condition = load_at(fx, &io.inputs[0], &[zero])?;
        let copy_from = |fx: &mut FunctionEmitter<'_>, which: usize, io: &NodeIo, shape: &[usize]| {
            for_each_index(fx, shape, &mut |fx, indices| {
                let value = load_at(fx, &io.inputs[which], indices)?;
                store_at(fx, &io.outputs[0], indices, value)
            })
        };
        let shape = self.spec.layout.active().to_vec();
        fx.if_then_else(
            condition,
            |fx| copy_from(fx, 1, io, &shape),
            |fx| copy_from(fx, 2, io, &shape),
        )
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let condition = inputs[0].get(&[0]).as_bool().ok_or_else(|| {
            ModelError::InvalidGraph("selector condition must be boolean".to_owned())
        })?;
        Ok(vec![if condition {
            inputs[1].clone()
        } else {
            inputs[2].clone()
        }])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.spec.ty);
        writer.set("layout", &self.spec.layout);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
