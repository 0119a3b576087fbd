//! The map compiler: drives a map through the transformation pipeline and
//! lowers the final model into an emitted module.

use std::collections::HashMap;

use tracing::{debug, info};

use skein_model::{
    CompilerOptions, Map, Model, ModelError, NodeId, NodeIo, OutputPortRef, PortSpec, Submodel,
    TransformContext, TransformationRegistry,
};
use skein_passes::refine_and_optimize;
use skein_value::backend::interp::InterpArtifact;
use skein_value::backend::rust_source;
use skein_value::loopnests::ViewBinding;
use skein_value::module::{FunctionDeclaration, GlobalId, Module, ValueType};

use crate::compiled_map::CompiledMap;
use crate::error::CompileError;

/// A map lowered to an emitted module, with the endpoint tables needed to
/// talk to it.
pub struct LoweredMap {
    /// The emitted module.
    pub module: Module,
    /// Named inputs: name, the settable state global, and the value spec.
    pub inputs: Vec<(String, GlobalId, PortSpec)>,
    /// Named outputs: name, the port's buffer global, and the value spec.
    pub outputs: Vec<(String, GlobalId, PortSpec)>,
}

/// The entry function's symbol in every lowered module.
pub const ENTRY_SYMBOL: &str = "compute";

/// Compiles maps: refine-and-optimize to fixpoint, verify compilability,
/// emit one function per node plus an entry function, and hand the module
/// to a backend.
pub struct MapCompiler<'r> {
    registry: &'r TransformationRegistry,
    options: CompilerOptions,
}

impl Default for MapCompiler<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl MapCompiler<'static> {
    /// A compiler over the global transformation registry with default
    /// options.
    pub fn new() -> Self {
        Self {
            registry: skein_passes::global_registry(),
            options: CompilerOptions::default(),
        }
    }
}

impl<'r> MapCompiler<'r> {
    /// A compiler over an instance registry.
    pub fn with_registry(registry: &'r TransformationRegistry) -> Self {
        Self {
            registry,
            options: CompilerOptions::default(),
        }
    }

    /// Replaces the compiler options.
    pub fn options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    /// Compiles the map into a runnable artifact. The map itself is left
    /// unchanged.
    pub fn compile(&self, map: &Map) -> Result<CompiledMap, CompileError> {
        let lowered = self.lower(map)?;
        Ok(CompiledMap::new(
            InterpArtifact::new(lowered.module),
            lowered.inputs,
            lowered.outputs,
        ))
    }

    /// Renders the map's emitted module as Rust source instead of lowering
    /// it in process.
    pub fn render_rust_source(&self, map: &Map) -> Result<String, CompileError> {
        let lowered = self.lower(map)?;
        Ok(rust_source::render(&lowered.module)?)
    }

    /// Runs the pipeline and emits the module.
    pub fn lower(&self, map: &Map) -> Result<LoweredMap, CompileError> {
        let ctx = TransformContext::new(self.options.clone());
        let model = map.model();

        // Track the named endpoints through the rewrite by position: the
        // submodel's output list carries [named outputs][named inputs' ports]
        // [remaining sinks].
        let named_outputs: Vec<OutputPortRef> = map.outputs().iter().map(|(_, p)| *p).collect();
        let input_ports: Vec<OutputPortRef> = map
            .inputs()
            .iter()
            .map(|(_, id)| OutputPortRef { node: *id, port: 0 })
            .collect();
        let mut tracked = named_outputs.clone();
        tracked.extend(&input_ports);
        for sink in model.sink_ports() {
            if !tracked.contains(&sink) {
                tracked.push(sink);
            }
        }
        let submodel = Submodel::new(Vec::new(), tracked);

        info!("compiling map");
        let (lowered_model, mapped) =
            refine_and_optimize(model, &submodel, self.registry, &ctx)?;

        for id in lowered_model.iter() {
            let node = lowered_model.node(id);
            if !ctx.is_node_compilable(node) {
                return Err(CompileError::Model(ModelError::RefinementLoop {
                    iterations: self.options.max_refinement_iterations,
                    type_name: node.type_name().to_owned(),
                }));
            }
        }

        let n_out = named_outputs.len();
        let final_outputs = &mapped.outputs[..n_out];
        let final_inputs: Vec<NodeId> = mapped.outputs[n_out..n_out + input_ports.len()]
            .iter()
            .map(|p| p.node)
            .collect();

        let (module, port_globals, state_globals) =
            self.emit_module(&lowered_model, &ctx)?;

        let inputs = map
            .inputs()
            .iter()
            .zip(&final_inputs)
            .map(|((name, _), id)| {
                let state = lowered_model
                    .node(*id)
                    .initial_state()
                    .expect("map inputs are settable");
                let spec = PortSpec {
                    ty: state.element_type(),
                    layout: state.layout().clone(),
                };
                (name.clone(), state_globals[id], spec)
            })
            .collect();
        let outputs = map
            .outputs()
            .iter()
            .zip(final_outputs)
            .map(|((name, _), port)| {
                let spec = lowered_model
                    .output_spec(*port)
                    .expect("tracked ports exist")
                    .clone();
                (name.clone(), port_globals[port], spec)
            })
            .collect();

        Ok(LoweredMap {
            module,
            inputs,
            outputs,
        })
    }

    #[allow(clippy::type_complexity, reason = "internal lowering tables")]
    fn emit_module(
        &self,
        model: &Model,
        _ctx: &TransformContext,
    ) -> Result<
        (
            Module,
            HashMap<OutputPortRef, GlobalId>,
            HashMap<NodeId, GlobalId>,
        ),
        CompileError,
    > {
        let mut module = Module::new();
        let mut port_globals: HashMap<OutputPortRef, GlobalId> = HashMap::new();
        let mut state_globals: HashMap<NodeId, GlobalId> = HashMap::new();
        let mut calls: Vec<(skein_value::FuncId, Vec<GlobalId>, Vec<GlobalId>, Option<GlobalId>)> =
            Vec::new();

        for (position, id) in model.iter().enumerate() {
            let node = model.node(id);
            let input_globals: Vec<GlobalId> = model
                .inputs(id)
                .iter()
                .map(|input| port_globals[&input.source])
                .collect();
            let output_globals: Vec<GlobalId> = model
                .outputs(id)
                .iter()
                .enumerate()
                .map(|(port, output)| {
                    let global = module.add_global(
                        &format!("n{position}_out{port}"),
                        output.spec.ty,
                        output.spec.layout.allocated_size(),
                    );
                    port_globals.insert(OutputPortRef { node: id, port }, global);
                    global
                })
                .collect();
            let state_global = node.initial_state().map(|state| {
                let global = module
                    .add_global_with_init(&format!("n{position}_state"), state.into_buffer());
                state_globals.insert(id, global);
                global
            });

            let mut params: Vec<ValueType> = Vec::new();
            let mut layouts: Vec<skein_value::MemoryLayout> = Vec::new();
            for input in model.inputs(id) {
                params.push(ValueType::Pointer(input.spec.ty));
                layouts.push(input.spec.layout.clone());
            }
            for output in model.outputs(id) {
                params.push(ValueType::Pointer(output.spec.ty));
                layouts.push(output.spec.layout.clone());
            }
            if let Some(state) = node.initial_state() {
                params.push(ValueType::Pointer(state.element_type()));
                layouts.push(state.layout().clone());
            }

            let decl = FunctionDeclaration::new(format!("{}_{position}", node.type_name()))
                .parameters(params);
            debug!(name = decl.name(), "emitting node function");
            let n_in = model.inputs(id).len();
            let n_out = model.outputs(id).len();
            let has_state = state_global.is_some();
            let scratch_limit = self.options.scratch_limit;
            let func = module.define(decl, |fx| {
                let view = |i: usize, ptr| ViewBinding {
                    ptr,
                    layout: layouts[i].clone(),
                };
                let io = NodeIo {
                    inputs: (0..n_in).map(|i| view(i, fx.param(i))).collect(),
                    outputs: (n_in..n_in + n_out).map(|i| view(i, fx.param(i))).collect(),
                    state: has_state.then(|| view(n_in + n_out, fx.param(n_in + n_out))),
                    scratch_limit,
                };
                node.compile(fx, &io)?;
                fx.ret(None)
            })?;
            calls.push((func, input_globals, output_globals, state_global));
        }

        let entry = FunctionDeclaration::new(ENTRY_SYMBOL).undecorated();
        module.define(entry, |fx| {
            for (func, inputs, outputs, state) in &calls {
                let mut args = Vec::new();
                for &global in inputs.iter().chain(outputs) {
                    args.push(fx.global_ref(global));
                }
                if let Some(state) = state {
                    args.push(fx.global_ref(*state));
                }
                fx.call(*func, &args)?;
            }
            fx.ret(None)
        })?;

        Ok((module, port_globals, state_globals))
    }
}
