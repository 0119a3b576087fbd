//! The transformation framework: polymorphic submodel rewriters, the
//! compile context they consult, and the ordered registry the driver walks.

use std::sync::Arc;

use tracing::debug;

use crate::error::ModelError;
use crate::model::Model;
use crate::node::Node;
use crate::port::NodeId;
use crate::properties::PropertyBag;
use crate::submodel::Submodel;
use crate::transformer::Transformer;

/// Options steering compilation, carried by the [`TransformContext`].
#[derive(Clone, Debug)]
pub struct CompilerOptions {
    /// Upper bound on refinement iterations.
    pub max_refinement_iterations: usize,
    /// Whether `parallelize` directives may produce parallel code.
    pub enable_parallelism: bool,
    /// Cap on caching scratch, in bytes.
    pub scratch_limit: Option<usize>,
    /// Open-ended options consumed by individual transformations
    /// (`SetCompilerOptions` copies this bag into metadata; the convolution
    /// pass reads its method preference from here).
    pub extra: PropertyBag,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            max_refinement_iterations: 10,
            enable_parallelism: true,
            scratch_limit: None,
            extra: PropertyBag::new(),
        }
    }
}

/// Decides whether a node is acceptable to the active emitter.
pub type CompilableFn = dyn Fn(&dyn Node) -> bool + Send + Sync;

/// The context a transformation runs under: compiler options plus the
/// emitter's compilability predicate.
#[derive(Clone, Default)]
pub struct TransformContext {
    /// Compiler options.
    pub options: CompilerOptions,
    compilable: Option<Arc<CompilableFn>>,
}

impl TransformContext {
    /// A context with the given options.
    pub fn new(options: CompilerOptions) -> Self {
        Self {
            options,
            compilable: None,
        }
    }

    /// Overrides the compilability predicate.
    pub fn with_compilable(mut self, predicate: Arc<CompilableFn>) -> Self {
        self.compilable = Some(predicate);
        self
    }

    /// Whether the active emitter can compile the node. Defaults to the
    /// node's own compile capability.
    pub fn is_node_compilable(&self, node: &dyn Node) -> bool {
        match &self.compilable {
            Some(predicate) => predicate(node),
            None => node.is_compilable(),
        }
    }

    /// Whether every node of the model is compilable.
    pub fn is_model_compilable(&self, model: &Model) -> bool {
        model.iter().all(|id| self.is_node_compilable(model.node(id)))
    }
}

/// A registered rewrite over submodels.
pub trait Transformation: Send + Sync {
    /// The transformation's name, for logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Rewrites the submodel onto the transformer's destination model and
    /// returns the corresponding view of the destination.
    fn transform(
        &self,
        submodel: &Submodel,
        source_model: &Model,
        transformer: &mut Transformer,
        ctx: &TransformContext,
    ) -> Result<Submodel, ModelError>;

    /// Applies the transformation to a whole model: runs [`Self::transform`]
    /// through a fresh transformer and prunes the destination to the
    /// rewritten outputs. Iterating transformations override this.
    fn apply(
        &self,
        model: &Model,
        submodel: &Submodel,
        ctx: &TransformContext,
    ) -> Result<(Model, Submodel), ModelError> {
        let mut transformer = Transformer::new();
        let out = self.transform(submodel, model, &mut transformer, ctx)?;
        let mut dest = transformer.into_dest()?;
        dest.prune(&out.outputs);
        Ok((dest, out))
    }
}

/// Visits every node of the submodel in topological order, letting the
/// visit function decide how it appears in the destination; nodes outside
/// the submodel are copied verbatim. The shared skeleton of node-local
/// transformations.
pub fn transform_node_local<F>(
    submodel: &Submodel,
    source_model: &Model,
    transformer: &mut Transformer,
    ctx: &TransformContext,
    mut visit: F,
) -> Result<Submodel, ModelError>
where
    F: FnMut(&Model, NodeId, &mut Transformer, &TransformContext) -> Result<(), ModelError>,
{
    let inside: std::collections::HashSet<NodeId> =
        submodel.nodes(source_model).into_iter().collect();
    transformer.run(source_model, ctx, |model, id, transformer, ctx| {
        if inside.contains(&id) {
            visit(model, id, transformer, ctx)
        } else {
            transformer.copy_node(model, id).map(|_| ())
        }
    })?;
    transformer.map_submodel(submodel)
}

/// An ordered collection of transformations, applied in registration order.
#[derive(Default)]
pub struct TransformationRegistry {
    transformations: Vec<Box<dyn Transformation>>,
}

impl TransformationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transformation.
    pub fn add<T: Transformation + 'static>(&mut self, transformation: T) {
        self.transformations.push(Box::new(transformation));
    }

    /// The registered transformations, in order.
    pub fn iter(&self) -> impl Iterator<Item = &dyn Transformation> {
        self.transformations.iter().map(|t| &**t)
    }

    /// Number of registered transformations.
    pub fn len(&self) -> usize {
        self.transformations.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.transformations.is_empty()
    }

    /// Applies every registered transformation once, in order.
    pub fn apply_all(
        &self,
        model: &Model,
        submodel: &Submodel,
        ctx: &TransformContext,
    ) -> Result<(Model, Submodel), ModelError> {
        let mut current_model = None;
        let mut current_submodel = submodel.clone();
        for transformation in self.iter() {
            debug!(name = transformation.name(), "applying transformation");
            let source = current_model.as_ref().unwrap_or(model);
            let (next_model, next_submodel) =
                transformation.apply(source, &current_submodel, ctx)?;
            current_model = Some(next_model);
            current_submodel = next_submodel;
        }
        Ok((
            current_model.unwrap_or_else(|| {
                // No transformations registered: reproduce the model.
                let mut transformer = Transformer::new();
                transformer
                    .run(model, ctx, |m, id, t, _| t.copy_node(m, id).map(|_| ()))
                    .expect("identity rewrite of a valid model");
                transformer.into_dest().expect("identity rewrite is valid")
            }),
            current_submodel,
        ))
    }
}
