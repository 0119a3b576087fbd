//! Archives: schema-versioned key/value serialization of nodes and models,
//! plus the node-type registry that reconstructs nodes from archives.

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};

use crate::error::ModelError;
use crate::model::Model;
use crate::node::Node;
use crate::port::{NodeId, OutputPortRef};
use crate::properties::PropertyBag;

/// Writes one node's parameters as a typed key/value dictionary.
#[derive(Debug, Default)]
pub struct ArchiveWriter {
    entries: Map<String, Value>,
}

impl ArchiveWriter {
    /// An empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a value under a key.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        let value = serde_json::to_value(value).expect("archive values serialize");
        self.entries.insert(key.into(), value);
    }

    fn into_value(self) -> Value {
        Value::Object(self.entries)
    }
}

/// Reads one node's parameters back out of an archive.
pub struct ArchiveReader<'a> {
    version: u32,
    entries: &'a Map<String, Value>,
}

impl ArchiveReader<'_> {
    /// The schema version the node was written with.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Reads a required key; absence or a type disagreement is an archive
    /// mismatch.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ModelError> {
        let value = self
            .entries
            .get(key)
            .ok_or_else(|| ModelError::ArchiveMismatch(format!("missing key `{key}`")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ModelError::ArchiveMismatch(format!("key `{key}`: {e}")))
    }

    /// Reads an optional key.
    pub fn get_optional<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.entries
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

/// Reconstructs a node from its archive.
pub type NodeFactory = fn(&ArchiveReader<'_>) -> Result<Box<dyn Node>, ModelError>;

/// Maps runtime type names to node factories. Built once at startup, read
/// thereafter.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<&'static str, NodeFactory>,
}

impl NodeRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under a runtime type name.
    pub fn register(&mut self, type_name: &'static str, factory: NodeFactory) {
        self.factories.insert(type_name, factory);
    }

    /// Constructs a node of the named type from an archive.
    pub fn create(
        &self,
        type_name: &str,
        reader: &ArchiveReader<'_>,
    ) -> Result<Box<dyn Node>, ModelError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| ModelError::UnknownNodeType(type_name.to_owned()))?;
        factory(reader)
    }

    /// Returns true if the type name has a registered factory.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }
}

/// Version of the model container format itself (distinct from each node's
/// own schema version).
const MODEL_ARCHIVE_VERSION: u32 = 1;

/// Serializes a model: node type names, schema versions, wiring, metadata,
/// and per-node parameter dictionaries.
pub fn model_to_archive(model: &Model) -> Result<Value, ModelError> {
    let index: HashMap<NodeId, usize> = model.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut nodes = Vec::with_capacity(model.len());
    for id in model.iter() {
        let node = model.node(id);
        let mut writer = ArchiveWriter::new();
        node.archive(&mut writer);
        let inputs: Vec<[usize; 2]> = model
            .inputs(id)
            .iter()
            .map(|input| [index[&input.source.node], input.source.port])
            .collect();
        nodes.push(json!({
            "type": node.type_name(),
            "version": node.archive_version(),
            "inputs": inputs,
            "metadata": model.node_metadata(id),
            "archive": writer.into_value(),
        }));
    }
    Ok(json!({
        "version": MODEL_ARCHIVE_VERSION,
        "metadata": model.metadata(),
        "nodes": nodes,
    }))
}

/// Reconstructs a model from its archive, resolving node types through the
/// registry.
pub fn model_from_archive(value: &Value, registry: &NodeRegistry) -> Result<Model, ModelError> {
    let object = value
        .as_object()
        .ok_or_else(|| ModelError::ArchiveMismatch("model archive is not an object".to_owned()))?;
    let version = object
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| ModelError::ArchiveMismatch("missing model version".to_owned()))?;
    if version != u64::from(MODEL_ARCHIVE_VERSION) {
        return Err(ModelError::ArchiveMismatch(format!(
            "model archive version {version} is unsupported"
        )));
    }

    let mut model = Model::new();
    if let Some(metadata) = object.get("metadata") {
        *model.metadata_mut() = serde_json::from_value(metadata.clone())
            .map_err(|e| ModelError::ArchiveMismatch(format!("model metadata: {e}")))?;
    }
    let nodes = object
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::ArchiveMismatch("missing node list".to_owned()))?;

    let mut ids: Vec<NodeId> = Vec::with_capacity(nodes.len());
    for entry in nodes {
        let entry = entry
            .as_object()
            .ok_or_else(|| ModelError::ArchiveMismatch("node entry is not an object".to_owned()))?;
        let type_name = entry
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ModelError::ArchiveMismatch("missing node type".to_owned()))?;
        let node_version = entry
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ModelError::ArchiveMismatch("missing node version".to_owned()))?
            as u32;
        let archive = entry
            .get("archive")
            .and_then(Value::as_object)
            .ok_or_else(|| ModelError::ArchiveMismatch("missing node archive".to_owned()))?;
        let inputs: Vec<[usize; 2]> = entry
            .get("inputs")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| ModelError::ArchiveMismatch(format!("node inputs: {e}")))?
            .unwrap_or_default();

        let reader = ArchiveReader {
            version: node_version,
            entries: archive,
        };
        let node = registry.create(type_name, &reader)?;
        if node.archive_version() < node_version {
            return Err(ModelError::ArchiveMismatch(format!(
                "`{type_name}` archive version {node_version} is newer than the reader"
            )));
        }

        let input_refs: Vec<OutputPortRef> = inputs
            .iter()
            .map(|&[node_index, port]| {
                ids.get(node_index)
                    .map(|&node| OutputPortRef { node, port })
                    .ok_or_else(|| {
                        ModelError::ArchiveMismatch(format!(
                            "node input references forward index {node_index}"
                        ))
                    })
            })
            .collect::<Result<_, _>>()?;
        let id = model.add_boxed(node, &input_refs)?;
        if let Some(metadata) = entry.get("metadata") {
            *model.node_metadata_mut(id) = serde_json::from_value::<PropertyBag>(metadata.clone())
                .map_err(|e| ModelError::ArchiveMismatch(format!("node metadata: {e}")))?;
        }
        ids.push(id);
    }
    model.verify()?;
    Ok(model)
}
