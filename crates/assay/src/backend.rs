//! The resource backend the executor pulls field data from.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::types::Type;
use crate::value::{Data, ResourceHandle, RuntimeValue};

mod memory;

pub use memory::{FieldState, MemoryBackend};

/// Receives field updates. May be called any number of times, from any
/// thread. `Error::NotReady` means "still loading"; any other error is final.
pub type FieldCallback = Arc<dyn Fn(Result<Data>) + Send + Sync>;

/// Named init arguments for a resource.
pub type ResourceArgs = BTreeMap<String, RuntimeValue>;

pub trait ResourceBackend: Send + Sync {
    fn schema(&self) -> &Schema;

    fn create_resource(&self, name: &str, args: &ResourceArgs) -> Result<ResourceHandle>;

    fn create_resource_with_id(
        &self,
        name: &str,
        id: &str,
        args: &ResourceArgs,
    ) -> Result<ResourceHandle>;

    /// Subscribes `watcher_id` to `field` of `handle`. If the field is already
    /// known the callback may run before this returns.
    fn watch_field(
        &self,
        handle: &ResourceHandle,
        field: &str,
        watcher_id: &str,
        on_update: FieldCallback,
    ) -> Result<()>;

    fn unregister(&self, watcher_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    #[serde(default)]
    pub fields: BTreeMap<String, FieldInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    #[serde(
        rename = "type",
        serialize_with = "serialize_label",
        deserialize_with = "deserialize_label"
    )]
    pub typ: Type,
}

fn serialize_label<S: Serializer>(typ: &Type, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&typ.label())
}

fn deserialize_label<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Type, D::Error> {
    let label = String::deserialize(deserializer)?;
    Type::from_label(&label).map_err(serde::de::Error::custom)
}

impl Schema {
    pub fn from_json(input: &str) -> Result<Schema> {
        serde_json::from_str(input).map_err(|err| Error::Config(format!("schema: {err}")))
    }

    pub fn from_toml(input: &str) -> Result<Schema> {
        toml::from_str(input).map_err(|err| Error::Config(format!("schema: {err}")))
    }

    /// Reads a schema file; `.json` files are JSON, anything else TOML.
    pub fn load(path: &Path) -> Result<Schema> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        let parsed = if path.extension().is_some_and(|ext| ext == "json") {
            Schema::from_json(&text)
        } else {
            Schema::from_toml(&text)
        };
        parsed.map_err(|err| Error::Config(format!("failed to parse {}: {err}", path.display())))
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceInfo> {
        self.resources.get(name)
    }

    pub fn field_type(&self, resource: &str, field: &str) -> Option<&Type> {
        self.resources
            .get(resource)
            .and_then(|info| info.fields.get(field))
            .map(|field| &field.typ)
    }

    pub fn with_field(mut self, resource: &str, field: &str, typ: Type) -> Self {
        self.resources
            .entry(resource.to_string())
            .or_default()
            .fields
            .insert(field.to_string(), FieldInfo { typ });
        self
    }
}
