//! Streaming sink nodes: values pushed to a host callback.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::module::{FunctionDeclaration, ValueType};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

use crate::codegen::{for_each_index, load_at, store_at};

/// Passes its input through and hands it to a host callback.
///
/// Compiled artifacts call an external function `(ptr, len)` with the
/// freshly written output buffer; the host binds the callback by name.
#[derive(Clone)]
pub struct SinkNode {
    spec: PortSpec,
    callback: String,
}

impl SinkNode {
    /// A sink of the given shape, wired to the named host callback.
    pub fn new(ty: ElementType, shape: &[usize], callback: impl Into<String>) -> Self {
        Self {
            spec: PortSpec::shaped(ty, shape),
            callback: callback.into(),
        }
    }

    /// The host callback's symbol.
    pub fn callback(&self) -> &str {
        &self.callback
    }

    pub(crate) fn from_archive(reader: &ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError> {
        let ty: ElementType = reader.get("type")?;
        let layout: MemoryLayout = reader.get("layout")?;
        let callback: String = reader.get("callback")?;
        Ok(Box::new(Self {
            spec: PortSpec { ty, layout },
            callback,
        }))
    }
}

impl Node for SinkNode {
    fn type_name(&self) -> &'static str {
        "sink"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        match inputs {
            [one] if one.ty == self.spec.ty && one.active_count() == self.spec.active_count() => {
                Ok(())
            }
            [_] => Err(ModelError::ShapeMismatch {
                node: None,
                detail: "sink input disagrees with its declared spec".to_owned(),
            }),
            _ => Err(ModelError::InvalidGraph("sink nodes take one input".to_owned())),
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
        })?;
        let decl = FunctionDeclaration::new(self.callback.clone())
            .undecorated()
            .parameters(vec![
                ValueType::Pointer(self.spec.ty),
                ValueType::Scalar(ElementType::I64),
            ]);
        let callback = fx.module().declare(decl)?;
        let len = fx.literal_index(self.spec.layout.allocated_size() as i64);
        fx.call(callback, &[io.outputs[0].ptr, len])?;
        Ok(())
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
        writer.set("callback", &self.callback);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
