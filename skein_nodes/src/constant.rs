//! Constant nodes.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::{EmitError, FunctionEmitter, Tensor};

use crate::codegen::store_at;

/// A node holding a constant tensor. Has no inputs; compiles to immediate
/// stores of its values.
#[derive(Clone)]
pub struct ConstantNode {
    values: Tensor,
}

impl ConstantNode {
    /// Wraps a tensor as a constant.
    pub fn new(values: Tensor) -> Self {
        Self { values }
    }

    /// A one-dimensional constant.
    pub fn vector<T: skein_value::HostElement>(values: Vec<T>) -> Self {
        Self {
            values: Tensor::from_vec(values),
        }
    }

    /// The constant's values.
    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let values: Tensor = reader.get("values")?;
        Ok(Box::new(Self { values }))
    }
}

impl Node for ConstantNode {
    fn type_name(&self) -> &'static str {
        "constant"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![PortSpec {
            ty: self.values.element_type(),
            layout: self.values.layout().clone(),
        }]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        if inputs.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidGraph("constant nodes take no inputs".to_owned()))
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
        // Immediate stores; the active region is enumerated at emission time.
        for index in self.values.layout().active_indices() {
            let value = fx.literal(self.values.get(&index));
            let indices: Vec<_> = index
                .iter()
                .map(|&i| fx.literal_index(i as i64))
                .collect();
            store_at(fx, &io.outputs[0], &indices, value)?;
        }
        Ok(())
    }

    fn compute(
        &self,
        _inputs: &[&Tensor],
        _state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        Ok(vec![self.values.clone()])
    }

    fn archive(&self, writer: &mut ArchiveWriter) {
        writer.set("values", &self.values);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_model::{ArchiveWriter, NodeRegistry};

    #[test]
    fn archive_round_trip() {
        let node = ConstantNode::vector(vec![1.5f32, -2.5]);
        let mut writer = ArchiveWriter::new();
        node.archive(&mut writer);

        let mut registry = NodeRegistry::new();
        registry.register("constant", ConstantNode::from_archive);
        // Round-trip through the model archive path is covered in the
        // library tests; here just check the factory is registered.
        assert!(registry.contains("constant"));
    }
}
