//! The compiled map: the invocation surface over an emitted artifact.

use skein_model::PortSpec;
use skein_value::backend::interp::{HostFn, InterpArtifact};
use skein_value::module::{FuncId, GlobalId};
use skein_value::{BackendError, Scalar, Tensor};

use crate::compile::ENTRY_SYMBOL;
use crate::error::CompileError;

/// A compiled artifact with named inputs and outputs.
///
/// Owns the emitted module and every constant it references. Inputs are
/// written into the artifact's buffers with runtime element-type and size
/// checks; `compute` invokes the emitted entry function; outputs are read
/// back by name.
pub struct CompiledMap {
    artifact: InterpArtifact,
    inputs: Vec<(String, GlobalId, PortSpec)>,
    outputs: Vec<(String, GlobalId, PortSpec)>,
}

impl CompiledMap {
    pub(crate) fn new(
        artifact: InterpArtifact,
        inputs: Vec<(String, GlobalId, PortSpec)>,
        outputs: Vec<(String, GlobalId, PortSpec)>,
    ) -> Self {
        Self {
            artifact,
            inputs,
            outputs,
        }
    }

    /// The named inputs, in declaration order.
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().map(|(name, ..)| name.as_str())
    }

    /// The named outputs, in declaration order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, ..)| name.as_str())
    }

    fn input_entry(&self, name: &str) -> Result<&(String, GlobalId, PortSpec), CompileError> {
        self.inputs
            .iter()
            .find(|(n, ..)| n == name)
            .ok_or_else(|| skein_model::ModelError::UnknownName(name.to_owned()).into())
    }

    /// Writes a named input. The tensor's element type and active size must
    /// match the input's declaration.
    pub fn set_input(&mut self, name: &str, value: &Tensor) -> Result<(), CompileError> {
        let (_, global, spec) = self.input_entry(name)?.clone();
        if value.element_type() != spec.ty {
            return Err(CompileError::Backend(BackendError::ElementType {
                expected: spec.ty,
                actual: value.element_type(),
            }));
        }
        if value.layout().active_count() != spec.active_count() {
            return Err(CompileError::Model(skein_model::ModelError::ShapeMismatch {
                node: None,
                detail: format!(
                    "input `{name}` takes {} elements, {} supplied",
                    spec.active_count(),
                    value.layout().active_count()
                ),
            }));
        }
        let buffer = self.artifact.global_mut(global)?;
        let positions: Vec<usize> = spec
            .layout
            .active_indices()
            .map(|index| spec.layout.flat_offset(&index))
            .collect();
        for (position, index) in positions.into_iter().zip(value.layout().active_indices()) {
            buffer.set(position, value.get(&index));
        }
        Ok(())
    }

    /// Runs the emitted entry function once.
    pub fn compute(&mut self) -> Result<(), CompileError> {
        self.artifact.call(ENTRY_SYMBOL, &[])?;
        Ok(())
    }

    /// Reads a named output computed by the last `compute`.
    pub fn get_output(&self, name: &str) -> Result<Tensor, CompileError> {
        let (_, global, spec) = self
            .outputs
            .iter()
            .find(|(n, ..)| n == name)
            .ok_or_else(|| CompileError::Model(skein_model::ModelError::UnknownName(name.to_owned())))?;
        let buffer = self.artifact.global(*global).clone();
        Ok(Tensor::from_buffer(buffer, spec.layout.clone()).map_err(skein_model::ModelError::from)?)
    }

    /// Binds a host callback to a source or sink node's external symbol.
    pub fn bind_callback(&mut self, symbol: &str, callback: HostFn) {
        self.artifact.bind_external(symbol, callback);
    }

    /// Resolves an emitted function by symbol for direct invocation.
    pub fn resolve_function(&mut self, symbol: &str) -> Option<CompiledFunction<'_>> {
        let func = self.artifact.resolve(symbol)?;
        Some(CompiledFunction {
            artifact: &mut self.artifact,
            func,
        })
    }
}

/// A directly callable emitted function, resolved by symbol.
pub struct CompiledFunction<'a> {
    artifact: &'a mut InterpArtifact,
    func: FuncId,
}

impl CompiledFunction<'_> {
    /// Invokes the function with scalar arguments.
    pub fn call(&mut self, args: &[Scalar]) -> Result<Option<Scalar>, CompileError> {
        Ok(self.artifact.call_id(self.func, args)?)
    }
}
