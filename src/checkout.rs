//! Checkout and materialization.
//!
//! Materializing a version writes its resolved entities as state rows and
//! asks each file's plugin to rebuild the file bytes. Checkout does this for
//! a hidden interim version anchored at a change set, leaving the active
//! version alone.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::change::NewChange;
use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::model::{Change, FileDescriptor, FileRecord, StateRow, Version, OWN_ENTITY_PLUGIN_KEY};
use crate::plugin::EntityChange;
use crate::version::{self, CreateVersionOptions, InheritsFrom};

/// A version together with its materialized files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedVersion {
    pub version: Version,
    pub files: Vec<FileRecord>,
}

impl MaterializedVersion {
    pub fn file(&self, file_id: &str) -> Option<&FileRecord> {
        self.files.iter().find(|file| file.descriptor.id == file_id)
    }
}

/// Materialize `change_set_id` into its interim version, creating the
/// version on first use.
pub fn checkout_change_set(lix: &mut Lix, change_set_id: &str) -> Result<MaterializedVersion> {
    if lix.store().change_set(change_set_id)?.is_none() {
        return Err(Error::not_found("change set", change_set_id));
    }
    let name = format!("{}-{}", lix.config().checkout.interim_prefix, change_set_id);

    let materialized = lix.transaction(|lix| {
        let existing = version::list_versions(lix, true)?.into_iter().find(|version| {
            version.hidden && version.name == name && version.change_set_id == change_set_id
        });
        let interim = match existing {
            Some(version) => version,
            None => version::create_version(
                lix,
                CreateVersionOptions {
                    name: Some(name.clone()),
                    at_change_set: Some(change_set_id.to_string()),
                    inherits_from: InheritsFrom::Nothing,
                    hidden: true,
                    ..Default::default()
                },
            )?,
        };
        let files = materialize_version(lix, &interim.id)?;
        Ok(MaterializedVersion {
            version: interim,
            files,
        })
    })?;
    info!(
        change_set = change_set_id,
        version = %materialized.version.id,
        files = materialized.files.len(),
        "checked out change set"
    );
    Ok(materialized)
}

/// Rewrite a version's state rows and file bytes from its resolved entities.
pub fn materialize_version(lix: &mut Lix, version_id: &str) -> Result<Vec<FileRecord>> {
    lix.transaction(|lix| {
        let state = version::version_state(lix, version_id)?;

        let mut rows = Vec::with_capacity(state.len());
        let mut by_file: BTreeMap<String, Vec<EntityChange>> = BTreeMap::new();
        for entity in state.into_values() {
            rows.push(state_row(&entity.change, &entity.content));
            by_file
                .entry(entity.change.file_id.clone())
                .or_default()
                .push(EntityChange {
                    change: entity.change,
                    snapshot_content: Some(entity.content),
                });
        }
        lix.store.replace_state(version_id, rows)?;

        let mut files = Vec::new();
        for (file_id, changes) in by_file {
            let Some(descriptor) = descriptor_for(lix, &file_id, &changes)? else {
                continue;
            };
            let plugin = lix.plugins().get(&descriptor.plugin_key)?;
            let data = plugin.apply_changes(&descriptor, &changes)?;
            let record = FileRecord { descriptor, data };
            lix.store.upsert_file(version_id, record.clone())?;
            files.push(record);
        }

        for stale in lix.store.files(version_id)? {
            if !files
                .iter()
                .any(|file| file.descriptor.id == stale.descriptor.id)
            {
                lix.store.remove_file(version_id, &stale.descriptor.id)?;
            }
        }

        debug!(version = version_id, files = files.len(), "materialized version");
        Ok(files)
    })
}

fn state_row(change: &Change, content: &serde_json::Value) -> StateRow {
    StateRow {
        entity_id: change.entity_id.clone(),
        file_id: change.file_id.clone(),
        schema_key: change.schema_key.clone(),
        schema_version: change.schema_version.clone(),
        plugin_key: change.plugin_key.clone(),
        change_id: change.id.clone(),
        snapshot_content: Some(content.clone()),
    }
}

/// Registered descriptor, or one derived from the entities' plugin. Entities
/// owned by the engine itself have no file.
fn descriptor_for(
    lix: &Lix,
    file_id: &str,
    changes: &[EntityChange],
) -> Result<Option<FileDescriptor>> {
    if let Some(descriptor) = lix.store().file_descriptor(file_id)? {
        return Ok(Some(descriptor));
    }
    let plugin_key = changes
        .iter()
        .map(|entity| entity.change.plugin_key.as_str())
        .find(|key| *key != OWN_ENTITY_PLUGIN_KEY);
    Ok(plugin_key.map(|plugin_key| FileDescriptor {
        id: file_id.to_string(),
        path: file_id.to_string(),
        plugin_key: plugin_key.to_string(),
    }))
}

/// Current bytes of a file in a version, materializing first.
pub fn read_file(lix: &mut Lix, version_id: &str, file_id: &str) -> Result<Option<Vec<u8>>> {
    materialize_version(lix, version_id)?;
    Ok(lix
        .store()
        .file(version_id, file_id)?
        .map(|record| record.data))
}

/// Diff `data` against the version's current file through the descriptor's
/// plugin and stage the detected entity changes.
pub fn write_file(
    lix: &mut Lix,
    version_id: &str,
    descriptor: FileDescriptor,
    data: &[u8],
) -> Result<Vec<Change>> {
    let plugin = lix.plugins().get(&descriptor.plugin_key)?;
    let staged = lix.transaction(|lix| {
        let before = read_file(lix, version_id, &descriptor.id)?;
        let detected = plugin.detect_changes(before.as_deref(), Some(data))?;
        lix.store.upsert_file_descriptor(descriptor.clone())?;

        let mut staged = Vec::with_capacity(detected.len());
        for entity in detected {
            let new_change = NewChange::new(
                entity.entity_id,
                &descriptor.id,
                entity.schema_key,
                entity.snapshot_content,
            )
            .with_plugin(&descriptor.plugin_key)
            .with_schema_version(entity.schema_version);
            staged.push(version::stage_entity(lix, version_id, new_change)?);
        }
        lix.store.upsert_file(
            version_id,
            FileRecord {
                descriptor: descriptor.clone(),
                data: data.to_vec(),
            },
        )?;
        Ok(staged)
    })?;
    debug!(
        version = version_id,
        file = %descriptor.id,
        changes = staged.len(),
        "wrote file"
    );
    Ok(staged)
}

/// File bytes at two points in history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeforeAfter {
    pub before: Option<Vec<u8>>,
    pub after: Option<Vec<u8>>,
}

/// Materialize one file at two change sets for diffing. The active
/// version's file row is saved and put back afterwards.
pub fn before_after_of_file(
    lix: &mut Lix,
    change_set_before: Option<&str>,
    change_set_after: Option<&str>,
    file_id: &str,
) -> Result<BeforeAfter> {
    let active = lix.active_version()?;
    let saved = lix.store().file(&active.id, file_id)?;

    let result = file_at(lix, change_set_before, file_id).and_then(|before| {
        let after = file_at(lix, change_set_after, file_id)?;
        Ok(BeforeAfter { before, after })
    });

    lix.transaction(|lix| match saved {
        Some(record) => lix.store.upsert_file(&active.id, record),
        None => lix.store.remove_file(&active.id, file_id),
    })?;
    result
}

fn file_at(lix: &mut Lix, change_set_id: Option<&str>, file_id: &str) -> Result<Option<Vec<u8>>> {
    let Some(change_set_id) = change_set_id else {
        return Ok(None);
    };
    let materialized = checkout_change_set(lix, change_set_id)?;
    Ok(materialized.file(file_id).map(|record| record.data.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::append_change;
    use crate::graph::{self, CreateChangeSetOptions};
    use crate::plugin::{JSON_PLUGIN_KEY, JSON_POINTER_SCHEMA};
    use serde_json::{json, Value};

    fn json_descriptor() -> FileDescriptor {
        FileDescriptor {
            id: "settings".to_string(),
            path: "/settings.json".to_string(),
            plugin_key: JSON_PLUGIN_KEY.to_string(),
        }
    }

    #[test]
    fn write_then_read_round_trips_json() {
        let mut lix = Lix::open_in_memory().unwrap();
        let main = lix.active_version().unwrap();
        let staged = write_file(
            &mut lix,
            &main.id,
            json_descriptor(),
            br#"{"theme": "dark", "size": 12}"#,
        )
        .unwrap();
        assert_eq!(staged.len(), 2);

        let bytes = read_file(&mut lix, &main.id, "settings").unwrap().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value, json!({"theme": "dark", "size": 12}));
    }

    #[test]
    fn unchanged_write_stages_nothing() {
        let mut lix = Lix::open_in_memory().unwrap();
        let main = lix.active_version().unwrap();
        let doc = br#"{"a": 1}"#;
        write_file(&mut lix, &main.id, json_descriptor(), doc).unwrap();
        let again = write_file(&mut lix, &main.id, json_descriptor(), doc).unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn own_entities_have_no_file() {
        let mut lix = Lix::open_in_memory().unwrap();
        let change = append_change(
            &mut lix,
            NewChange::new("k", "lix", "key_value", Some(json!({"v": 1}))),
        )
        .unwrap();
        let cs = graph::create_change_set(
            &mut lix,
            CreateChangeSetOptions {
                change_ids: vec![change.id],
                ..Default::default()
            },
        )
        .unwrap();
        let materialized = checkout_change_set(&mut lix, &cs.id).unwrap();
        assert!(materialized.files.is_empty());
        assert_eq!(
            lix.store().state(&materialized.version.id).unwrap().len(),
            1
        );
    }

    #[test]
    fn unknown_plugin_propagates() {
        let mut lix = Lix::open_in_memory().unwrap();
        let change = append_change(
            &mut lix,
            NewChange::new("/a", "doc", JSON_POINTER_SCHEMA, Some(json!({"path": "/a", "value": 1})))
                .with_plugin("markdown"),
        )
        .unwrap();
        let cs = graph::create_change_set(
            &mut lix,
            CreateChangeSetOptions {
                change_ids: vec![change.id],
                ..Default::default()
            },
        )
        .unwrap();
        let result = checkout_change_set(&mut lix, &cs.id);
        assert!(matches!(result, Err(Error::PluginNotFound(_))));
    }

    #[test]
    fn checkout_of_missing_change_set_fails() {
        let mut lix = Lix::open_in_memory().unwrap();
        assert!(matches!(
            checkout_change_set(&mut lix, "nope"),
            Err(Error::NotFound { .. })
        ));
    }
}
