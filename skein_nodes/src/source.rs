//! Streaming source nodes: values pulled from a host callback.

use std::any::Any;

use skein_model::{ArchiveReader, ArchiveWriter, ModelError, Node, NodeIo, PortSpec};
use skein_value::module::{FunctionDeclaration, ValueType};
use skein_value::{ElementType, EmitError, FunctionEmitter, MemoryLayout, Tensor};

/// A source whose values are produced by a host callback at compute time.
///
/// Compiled artifacts call an external function `(ptr, len)` that the host
/// binds by the callback name; the callback fills the buffer in place.
/// Under reference evaluation the node behaves like a settable input.
#[derive(Clone)]
pub struct SourceNode {
    spec: PortSpec,
    callback: String,
}

impl SourceNode {
    /// A source of the given shape, wired to the named host callback.
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

impl Node for SourceNode {
    fn type_name(&self) -> &'static str {
        "source"
    }

    fn output_specs(&self) -> Vec<PortSpec> {
        vec![self.spec.clone()]
    }

    fn validate_inputs(&self, inputs: &[PortSpec]) -> Result<(), ModelError> {
        if inputs.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidGraph("source nodes take no inputs".to_owned()))
        }
    }

    fn clone_box(&self) -> Box<dyn Node> {
        Box::new(self.clone())
    }

    fn is_compilable(&self) -> bool {
        true
    }

    fn compile(&self, fx: &mut FunctionEmitter<'_>, io: &NodeIo) -> Result<(), EmitError> {
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

    fn initial_state(&self) -> Option<Tensor> {
        Some(Tensor::zeros(self.spec.ty, self.spec.layout.canonicalized()))
    }

    fn compute(
        &self,
        _inputs: &[&Tensor],
        state: Option<&mut Tensor>,
    ) -> Result<Vec<Tensor>, ModelError> {
        let state = state.ok_or_else(|| {
            ModelError::InvalidGraph("source node computed without state".to_owned())
        })?;
        Ok(vec![state.clone()])
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
