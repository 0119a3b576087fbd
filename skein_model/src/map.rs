//! Maps: models with named inputs and named outputs.

use serde_json::{Value, json};

use skein_value::Tensor;

use crate::archive::{NodeRegistry, model_from_archive, model_to_archive};
use crate::error::ModelError;
use crate::model::{Evaluator, Model};
use crate::port::{NodeId, OutputPortRef};
use crate::transformer::Transformer;

/// A model plus two ordered, name-indexed tables: named inputs (each naming
/// a settable source node) and named outputs (each naming an output port).
/// The map owns its model.
pub struct Map {
    model: Model,
    inputs: Vec<(String, NodeId)>,
    outputs: Vec<(String, OutputPortRef)>,
}

impl Map {
    /// Wraps a model with named endpoints. Input names must refer to
    /// stateful source nodes (no graph inputs, settable state); all names
    /// must be unique.
    pub fn new(
        model: Model,
        inputs: Vec<(String, NodeId)>,
        outputs: Vec<(String, OutputPortRef)>,
    ) -> Result<Self, ModelError> {
        let mut seen = std::collections::HashSet::new();
        for name in inputs.iter().map(|(n, _)| n).chain(outputs.iter().map(|(n, _)| n)) {
            if !seen.insert(name.clone()) {
                return Err(ModelError::InvalidGraph(format!(
                    "duplicate map name `{name}`"
                )));
            }
        }
        for (name, id) in &inputs {
            if !model.contains(*id) {
                return Err(ModelError::UnknownName(name.clone()));
            }
            if !model.inputs(*id).is_empty() {
                return Err(ModelError::InvalidGraph(format!(
                    "map input `{name}` is not a source node"
                )));
            }
            if model.node(*id).initial_state().is_none() {
                return Err(ModelError::InvalidGraph(format!(
                    "map input `{name}` is not settable"
                )));
            }
        }
        for (name, port) in &outputs {
            model
                .output_spec(*port)
                .map_err(|_| ModelError::UnknownName(name.clone()))?;
        }
        Ok(Self {
            model,
            inputs,
            outputs,
        })
    }

    /// The underlying model.
    pub fn model(&self) -> &Model {
        &self.model
    }

    /// The named inputs, in declaration order.
    pub fn inputs(&self) -> &[(String, NodeId)] {
        &self.inputs
    }

    /// The named outputs, in declaration order.
    pub fn outputs(&self) -> &[(String, OutputPortRef)] {
        &self.outputs
    }

    /// The node behind a named input.
    pub fn input_named(&self, name: &str) -> Result<NodeId, ModelError> {
        self.inputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| ModelError::UnknownName(name.to_owned()))
    }

    /// The port behind a named output.
    pub fn output_named(&self, name: &str) -> Result<OutputPortRef, ModelError> {
        self.outputs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, port)| *port)
            .ok_or_else(|| ModelError::UnknownName(name.to_owned()))
    }

    /// Rebinds the map onto a transformed model: every named endpoint is
    /// remapped through the transformer's port correspondence, and the new
    /// model replaces the old.
    pub fn rebind(&self, transformer: &Transformer, model: Model) -> Result<Map, ModelError> {
        let inputs = self
            .inputs
            .iter()
            .map(|(name, id)| {
                let mapped = transformer.dest_of(OutputPortRef {
                    node: *id,
                    port: 0,
                })?;
                Ok((name.clone(), mapped.node))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        let outputs = self
            .outputs
            .iter()
            .map(|(name, port)| Ok((name.clone(), transformer.dest_of(*port)?)))
            .collect::<Result<Vec<_>, ModelError>>()?;
        Map::new(model, inputs, outputs)
    }

    /// Rebinds through explicit port assignments (used when the rewrite went
    /// through several transformers and only the final correspondence is
    /// known).
    pub fn rebind_ports(
        &self,
        model: Model,
        inputs: Vec<NodeId>,
        outputs: Vec<OutputPortRef>,
    ) -> Result<Map, ModelError> {
        if inputs.len() != self.inputs.len() || outputs.len() != self.outputs.len() {
            return Err(ModelError::InvalidGraph(
                "rebinding with mismatched endpoint counts".to_owned(),
            ));
        }
        let inputs = self
            .inputs
            .iter()
            .zip(inputs)
            .map(|((name, _), id)| (name.clone(), id))
            .collect();
        let outputs = self
            .outputs
            .iter()
            .zip(outputs)
            .map(|((name, _), port)| (name.clone(), port))
            .collect();
        Map::new(model, inputs, outputs)
    }

    /// Serializes the map: the model archive plus the name tables.
    pub fn to_archive(&self) -> Result<Value, ModelError> {
        let index: std::collections::HashMap<NodeId, usize> =
            self.model.iter().enumerate().map(|(i, id)| (id, i)).collect();
        Ok(json!({
            "model": model_to_archive(&self.model)?,
            "inputs": self.inputs.iter().map(|(n, id)| json!([n, index[id]])).collect::<Vec<_>>(),
            "outputs": self.outputs.iter().map(|(n, p)| json!([n, index[&p.node], p.port])).collect::<Vec<_>>(),
        }))
    }

    /// Reconstructs a map from its archive.
    pub fn from_archive(value: &Value, registry: &NodeRegistry) -> Result<Map, ModelError> {
        let object = value.as_object().ok_or_else(|| {
            ModelError::ArchiveMismatch("map archive is not an object".to_owned())
        })?;
        let model_value = object
            .get("model")
            .ok_or_else(|| ModelError::ArchiveMismatch("missing model".to_owned()))?;
        let model = model_from_archive(model_value, registry)?;
        let ids: Vec<NodeId> = model.iter().collect();

        let inputs: Vec<(String, usize)> = object
            .get("inputs")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| ModelError::ArchiveMismatch(format!("map inputs: {e}")))?
            .unwrap_or_default();
        let outputs: Vec<(String, usize, usize)> = object
            .get("outputs")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| ModelError::ArchiveMismatch(format!("map outputs: {e}")))?
            .unwrap_or_default();

        let resolve = |i: usize| {
            ids.get(i).copied().ok_or_else(|| {
                ModelError::ArchiveMismatch(format!("endpoint references node index {i}"))
            })
        };
        let inputs = inputs
            .into_iter()
            .map(|(name, i)| Ok((name, resolve(i)?)))
            .collect::<Result<Vec<_>, ModelError>>()?;
        let outputs = outputs
            .into_iter()
            .map(|(name, i, port)| {
                Ok((
                    name,
                    OutputPortRef {
                        node: resolve(i)?,
                        port,
                    },
                ))
            })
            .collect::<Result<Vec<_>, ModelError>>()?;
        Map::new(model, inputs, outputs)
    }

    /// A fresh reference-semantics runner over this map.
    pub fn runner(&self) -> MapRunner<'_> {
        MapRunner {
            map: self,
            evaluator: Evaluator::new(),
        }
    }
}

/// Reference (uncompiled) execution of a map: named set-input, run, named
/// read-output. Stateful nodes keep their state across runs.
pub struct MapRunner<'m> {
    map: &'m Map,
    evaluator: Evaluator,
}

impl MapRunner<'_> {
    /// Sets a named input.
    pub fn set_input(&mut self, name: &str, value: Tensor) -> Result<(), ModelError> {
        let id = self.map.input_named(name)?;
        self.evaluator.set_state(self.map.model(), id, value)
    }

    /// Runs the model once.
    pub fn compute(&mut self) -> Result<(), ModelError> {
        self.evaluator.run(self.map.model())
    }

    /// Reads a named output computed by the last run.
    pub fn get_output(&self, name: &str) -> Result<&Tensor, ModelError> {
        let port = self.map.output_named(name)?;
        self.evaluator
            .value(port)
            .ok_or_else(|| ModelError::UnknownName(name.to_owned()))
    }
}
