//! Component specifications.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Opaque metadata handed to the executor for a component type.
pub type ComponentMetadata = BTreeMap<String, serde_json::Value>;

/// A named, typed unit of work invoked during a phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSpec {
    /// Unique key within a run plan.
    pub name: String,
    /// Selects the executor; defaults to `name` when left empty.
    #[serde(rename = "type")]
    pub component_type: String,
    /// Start phase is fired without blocking the following entries.
    pub background: bool,
    pub metadata: ComponentMetadata,
}

impl ComponentSpec {
    pub fn new(name: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            component_type: component_type.into(),
            ..Default::default()
        }
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Decode the metadata map into an executor-specific struct.
    pub fn decode_metadata<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_json::Value::Object(self.metadata.clone().into_iter().collect());
        serde_json::from_value(value).map_err(|e| {
            FleetError::Config(format!("decoding metadata for component {}: {}", self.name, e))
        })
    }
}
