//! Data model for the change graph.
//!
//! Changes, snapshots, change sets, elements and edges are append-only.
//! Versions are the only records whose pointers move.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Snapshot id reserved for "entity deleted".
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

/// Label attached to change sets created by `create_checkpoint`.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

/// Plugin key of entities that are not backed by any file format.
pub const OWN_ENTITY_PLUGIN_KEY: &str = "lix_own_entity";

/// Identity of an entity: the unit a leaf is resolved for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl EntityKey {
    pub fn new(
        entity_id: impl Into<String>,
        file_id: impl Into<String>,
        schema_key: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            file_id: file_id.into(),
            schema_key: schema_key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file_id, self.schema_key, self.entity_id)
    }
}

/// An atomic mutation fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
}

impl Change {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }

    /// True when this change records a deletion.
    pub fn is_deletion(&self) -> bool {
        self.snapshot_id == NO_CONTENT_SNAPSHOT_ID
    }
}

/// Immutable content payload. `content` is `None` only for the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub content: Option<Value>,
}

impl Snapshot {
    pub fn no_content() -> Self {
        Self {
            id: NO_CONTENT_SNAPSHOT_ID.to_string(),
            content: None,
        }
    }

    /// Build a content-addressed snapshot; `None` maps to the sentinel.
    pub fn from_content(content: Option<Value>) -> Self {
        match content {
            Some(value) => Self {
                id: content_hash(&value),
                content: Some(value),
            },
            None => Self::no_content(),
        }
    }

    pub fn is_no_content(&self) -> bool {
        self.id == NO_CONTENT_SNAPSHOT_ID
    }
}

/// SHA-256 of the compact JSON encoding. `serde_json` maps keep keys sorted,
/// so equal values hash equally.
pub fn content_hash(value: &Value) -> String {
    let bytes = value.to_string();
    let digest = Sha256::digest(bytes.as_bytes());
    hex::encode(digest)
}

/// Commit-like node of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
}

/// Membership of one change in one change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: String,
    pub change_id: String,
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
}

impl ChangeSetElement {
    pub fn from_change(change_set_id: impl Into<String>, change: &Change) -> Self {
        Self {
            change_set_id: change_set_id.into(),
            change_id: change.id.clone(),
            entity_id: change.entity_id.clone(),
            file_id: change.file_id.clone(),
            schema_key: change.schema_key.clone(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }
}

/// Directed parent -> child link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeSetEdge {
    pub parent_id: String,
    pub child_id: String,
}

/// Mutable branch pointer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub name: String,
    pub change_set_id: String,
    pub working_change_set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_from_version_id: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Changes that could not be reconciled automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub id: String,
    pub key: String,
    pub conflicting_change_ids: BTreeSet<String>,
}

/// Binds a conflict to a version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConflictPointer {
    pub change_conflict_id: String,
    pub version_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

/// Where a file's bytes live and which plugin understands them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
    pub plugin_key: String,
}

/// Materialized file bytes scoped to one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub descriptor: FileDescriptor,
    pub data: Vec<u8>,
}

/// Materialized entity row scoped to one version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    pub change_id: String,
    pub snapshot_content: Option<Value>,
}

impl StateRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.file_id, &self.schema_key)
    }
}
