//! The output node: a stable, named sink for a map's results.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at};

/// Passes its input through unchanged. Maps name output ports on nodes of
/// this type so the readback location survives transformations.
#[derive(Clone)]
pub struct OutputNode {
    spec: PortSpec,
}

impl OutputNode {
    /// An output of the given shape.
    pub fn new(ty: ElementType, shape: &[usize]) -> Self {
        Self {
            spec: PortSpec::shaped(ty, shape),
        }
    }

    /// An output matching an existing port spec.
    pub fn like(spec: &PortSpec) -> Self {
        Self { spec: spec.clone() }
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        let layout: MemoryLayout = reader.get("layout")?;
        Ok(Box::new(Self {
            spec: PortSpec { ty, layout },
        }))
    }
}

impl Node for OutputNode {
    fn type_name(&self) -> &'static str {
        "output"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.spec.ty => {
                if one.active_count() == self.spec.active_count() {
                    Ok(())
                } else {
                    Err(ModelError::ShapeMismatch {
                        node: None,
                        detail: format!(
                            "output expects {} elements, producer supplies {}",
                            self.spec.active_count(),
                            one.active_count()
                        ),
                    })
                }
            }
            [one] => Err(ModelError::TypeMismatch {
                node: None,
                expected: self.spec.ty,
                actual: one.ty,
            }),
            _ => Err(ModelError::InvalidGraph("output nodes take one input".to_owned())),
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        for_each_index(fx, self.spec.layout.active(), &mut |fx, indices| {
            let value = load_at(fx, &io.inputs[0], indices)?;
            store_at(fx, &io.outputs[0], indices, value)
        })
    }

    fn compute(
        &self,
        inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        Ok(vec![inputs[0].clone()])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("type", self.spec.ty);
        writer.set("layout", &self.spec.layout);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
