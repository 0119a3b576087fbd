//! Property bags: key-addressable, typed, serializable metadata.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::ModelError;

/// An ordered string-keyed bag of JSON-typed values, attached to models and
/// nodes and carried through transformations.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PropertyBag(Map<String, Value>);

impl PropertyBag {
    /// An empty bag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Returns true if no properties are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sets a property, serializing the value.
    pub fn set<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        let value = serde_json::to_value(value).expect("property values serialize");
        self.0.insert(key.into(), value);
    }

    /// Reads a property, if present and of the requested shape.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Reads a property, failing with an archive-mismatch error when absent
    /// or ill-typed.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ModelError> {
        let value = self
            .0
            .get(key)
            .ok_or_else(|| ModelError::ArchiveMismatch(format!("missing property `{key}`")))?;
        serde_json::from_value(value.clone())
            .map_err(|e| ModelError::ArchiveMismatch(format!("property `{key}`: {e}")))
    }

    /// Returns true if the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Removes a property.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Merges another bag into this one; colliding keys take the other
    /// bag's values.
    pub fn merge_from(&mut self, other: &PropertyBag) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// The raw JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_round_trip() {
        let mut bag = PropertyBag::new();
        bag.set("iterations", 10u32);
        bag.set("label", "winograd");
        assert_eq!(Some(10u32), bag.get("iterations"));
        assert_eq!(Some("winograd".to_owned()), bag.get::<String>("label"));
        assert_eq!(None, bag.get::<u32>("label"));
        assert!(bag.require::<u32>("missing").is_err());
    }

    #[test]
    fn merge_overwrites_collisions() {
        let mut a = PropertyBag::new();
        a.set("x", 1);
        a.set("y", 2);
        let mut b = PropertyBag::new();
        b.set("y", 3);
        a.merge_from(&b);
        assert_eq!(Some(3), a.get("y"));
        assert_eq!(Some(1), a.get("x"));
    }
}
