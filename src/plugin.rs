//! Format plugins: turning file bytes into entity changes and back.
//!
//! Plugins are capability objects looked up by key at runtime. The bundled
//! [`JsonPlugin`] treats every JSON-pointer leaf of a document as one entity.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::model::{Change, FileDescriptor};

/// One entity-level difference reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub schema_key: String,
    pub schema_version: String,
    pub entity_id: String,
    /// `None` when the entity disappeared.
    pub snapshot_content: Option<Value>,
}

/// A change together with the content it points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityChange {
    pub change: Change,
    pub snapshot_content: Option<Value>,
}

pub trait FormatPlugin: Send + Sync {
    fn key(&self) -> &str;

    /// Entity differences between two renditions of a file.
    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<Vec<DetectedChange>>;

    /// Rebuild file bytes from the entity states of one file.
    fn apply_changes(&self, file: &FileDescriptor, changes: &[EntityChange]) -> Result<Vec<u8>>;
}

/// Plugins keyed by [`FormatPlugin::key`].
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn FormatPlugin>>,
}

impl PluginRegistry {
    /// Registry holding the bundled JSON plugin.
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(JsonPlugin));
        registry
    }

    /// Register a plugin, replacing any plugin with the same key.
    pub fn register(&mut self, plugin: Arc<dyn FormatPlugin>) {
        self.plugins.insert(plugin.key().to_string(), plugin);
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn FormatPlugin>> {
        self.plugins
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PluginNotFound(key.to_string()))
    }

    pub fn keys(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }
}

pub const JSON_PLUGIN_KEY: &str = "json";
pub const JSON_POINTER_SCHEMA: &str = "json_pointer_value";
pub const JSON_POINTER_SCHEMA_VERSION: &str = "1.0";

/// JSON documents as a set of pointer -> value entities.
///
/// Objects are flattened down to their non-object (or empty object) leaves;
/// arrays and scalars are stored whole. Snapshot content is
/// `{"path": <pointer>, "value": <leaf>}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPlugin;

impl JsonPlugin {
    fn parse(&self, bytes: Option<&[u8]>) -> Result<BTreeMap<String, Value>> {
        let mut leaves = BTreeMap::new();
        let Some(bytes) = bytes else {
            return Ok(leaves);
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(leaves);
        }
        let document: Value = serde_json::from_slice(bytes).map_err(|err| Error::Plugin {
            plugin_key: JSON_PLUGIN_KEY.to_string(),
            message: format!("invalid JSON: {err}"),
        })?;
        flatten(&document, String::new(), &mut leaves);
        Ok(leaves)
    }
}

impl FormatPlugin for JsonPlugin {
    fn key(&self) -> &str {
        JSON_PLUGIN_KEY
    }

    fn detect_changes(
        &self,
        before: Option<&[u8]>,
        after: Option<&[u8]>,
    ) -> Result<Vec<DetectedChange>> {
        let before = self.parse(before)?;
        let after = self.parse(after)?;
        let mut detected = Vec::new();

        for (pointer, value) in &after {
            if before.get(pointer) != Some(value) {
                detected.push(pointer_change(pointer, Some(value.clone())));
            }
        }
        for pointer in before.keys() {
            if !after.contains_key(pointer) {
                detected.push(pointer_change(pointer, None));
            }
        }
        Ok(detected)
    }

    fn apply_changes(&self, file: &FileDescriptor, changes: &[EntityChange]) -> Result<Vec<u8>> {
        let mut rows: Vec<(&str, &Value)> = Vec::new();
        for entity in changes {
            if entity.change.schema_key != JSON_POINTER_SCHEMA {
                continue;
            }
            let Some(content) = &entity.snapshot_content else {
                continue;
            };
            let value = content.get("value").ok_or_else(|| Error::Plugin {
                plugin_key: JSON_PLUGIN_KEY.to_string(),
                message: format!(
                    "entity {} in {} has no value",
                    entity.change.entity_id, file.path
                ),
            })?;
            rows.push((entity.change.entity_id.as_str(), value));
        }
        rows.sort_by(|a, b| a.0.cmp(b.0));

        let mut document = Value::Object(Map::new());
        for (pointer, value) in rows {
            insert_at_pointer(&mut document, pointer, value.clone())?;
        }
        Ok(serde_json::to_vec_pretty(&document)?)
    }
}

fn pointer_change(pointer: &str, value: Option<Value>) -> DetectedChange {
    DetectedChange {
        schema_key: JSON_POINTER_SCHEMA.to_string(),
        schema_version: JSON_POINTER_SCHEMA_VERSION.to_string(),
        entity_id: pointer.to_string(),
        snapshot_content: value.map(|value| serde_json::json!({ "path": pointer, "value": value })),
    }
}

fn flatten(value: &Value, pointer: String, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() || pointer.is_empty() => {
            for (key, child) in map {
                flatten(child, format!("{pointer}/{}", escape_token(key)), out);
            }
        }
        _ => {
            out.insert(pointer, value.clone());
        }
    }
}

fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

fn insert_at_pointer(document: &mut Value, pointer: &str, value: Value) -> Result<()> {
    if pointer.is_empty() {
        *document = value;
        return Ok(());
    }
    let Some(rest) = pointer.strip_prefix('/') else {
        return Err(Error::Plugin {
            plugin_key: JSON_PLUGIN_KEY.to_string(),
            message: format!("invalid JSON pointer '{pointer}'"),
        });
    };

    let tokens: Vec<String> = rest.split('/').map(unescape_token).collect();
    let mut current = document;
    for (index, token) in tokens.iter().enumerate() {
        let Some(map) = current.as_object_mut() else {
            return Err(overlapping_pointer(pointer));
        };
        if index + 1 == tokens.len() {
            let holds_children = map
                .get(token)
                .and_then(Value::as_object)
                .is_some_and(|children| !children.is_empty());
            if holds_children {
                return Err(overlapping_pointer(pointer));
            }
            map.insert(token.clone(), value);
            return Ok(());
        }
        current = map
            .entry(token.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    Ok(())
}

/// A pointer that passes through, or replaces, another entity's value.
fn overlapping_pointer(pointer: &str) -> Error {
    Error::Plugin {
        plugin_key: JSON_PLUGIN_KEY.to_string(),
        message: format!("pointer '{pointer}' overlaps a value set by another entity"),
    }
}
