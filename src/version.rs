//! Versions: named, mutable pointers into the change graph.
//!
//! A version points at a committed change set and owns a working change set
//! that collects staged changes until the next commit. Entities missing from
//! a version's own history fall back to the version it inherits from.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::change::{self, NewChange};
use crate::clock;
use crate::conflict;
use crate::engine::{Lix, ACTIVE_VERSION_KEY};
use crate::error::{Error, Result};
use crate::graph::{self, CreateChangeSetOptions};
use crate::label;
use crate::leaf::{self, LeafChange, TraversalMode};
use crate::model::{Change, ChangeSet, ChangeSetElement, EntityKey, Version, CHECKPOINT_LABEL};

/// Where a new version falls back to for entities it does not hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InheritsFrom {
    /// The configured global version.
    #[default]
    Global,
    Version(String),
    Nothing,
}

/// Input for [`create_version`].
#[derive(Debug, Clone, Default)]
pub struct CreateVersionOptions {
    pub id: Option<String>,
    pub name: Option<String>,
    /// Branch from this version: copy its leaves, working elements and
    /// conflict pointers.
    pub parent: Option<String>,
    /// Anchor at an existing change set instead of a fresh empty one.
    /// Ignored when `parent` is set.
    pub at_change_set: Option<String>,
    pub inherits_from: InheritsFrom,
    pub hidden: bool,
}

/// Create the global and main versions on a store that has none.
///
/// A store that already holds an active-version row or any version is left
/// untouched, whatever ids the current configuration names.
pub(crate) fn bootstrap(lix: &mut Lix) -> Result<()> {
    let versions = lix.config().versions.clone();
    if lix.store.kv_get(ACTIVE_VERSION_KEY)?.is_some() || !lix.store.versions()?.is_empty() {
        debug!("store already bootstrapped");
        return Ok(());
    }
    let deterministic = lix.config().clock.deterministic;

    lix.transaction(|lix| {
        if deterministic {
            clock::set_deterministic(lix.store.as_mut(), true)?;
        }
        let global = create_version(
            lix,
            CreateVersionOptions {
                id: Some(versions.global_id.clone()),
                name: Some(versions.global_name.clone()),
                inherits_from: InheritsFrom::Nothing,
                ..Default::default()
            },
        )?;
        let main = create_version(
            lix,
            CreateVersionOptions {
                name: Some(versions.main_name.clone()),
                inherits_from: InheritsFrom::Version(global.id.clone()),
                ..Default::default()
            },
        )?;
        lix.switch_version(&main.id)?;
        Ok(())
    })?;
    info!(global = %versions.global_id, main = %versions.main_name, "bootstrapped engine");
    Ok(())
}

/// Create a version, optionally branching from `options.parent`.
pub fn create_version(lix: &mut Lix, options: CreateVersionOptions) -> Result<Version> {
    lix.transaction(|lix| {
        let id = match options.id {
            Some(id) => id,
            None => lix.next_id()?,
        };
        if lix.store.version(&id)?.is_some() {
            return Err(Error::InvalidArgument(format!("version {id} already exists")));
        }

        let inherits_from_version_id = match options.inherits_from {
            InheritsFrom::Global => {
                let global_id = lix.config().versions.global_id.clone();
                (global_id != id).then_some(global_id)
            }
            InheritsFrom::Version(target) => {
                get_version(lix, &target)?;
                Some(target)
            }
            InheritsFrom::Nothing => None,
        };

        let parent = match &options.parent {
            Some(parent_id) => Some(get_version(lix, parent_id)?),
            None => None,
        };

        let (change_set_id, working_change_set_id) = match &parent {
            Some(parent) => branch_from(lix, parent)?,
            None => {
                let change_set_id = match options.at_change_set {
                    Some(anchor) => {
                        if lix.store.change_set(&anchor)?.is_none() {
                            return Err(Error::not_found("change set", anchor));
                        }
                        anchor
                    }
                    None => graph::create_change_set(lix, CreateChangeSetOptions::default())?.id,
                };
                let working =
                    graph::create_change_set(lix, CreateChangeSetOptions::default())?;
                (change_set_id, working.id)
            }
        };

        let name = options
            .name
            .unwrap_or_else(|| format!("version-{}", id_suffix(&id)));
        let version = Version {
            id,
            name,
            change_set_id,
            working_change_set_id,
            inherits_from_version_id,
            hidden: options.hidden,
        };
        lix.store.upsert_version(version.clone())?;

        if let Some(parent) = &parent {
            conflict::copy_conflict_pointers(lix, &parent.id, &version.id)?;
        }

        debug!(
            version = %version.id,
            name = %version.name,
            parent = ?parent.as_ref().map(|p| p.id.as_str()),
            "created version"
        );
        Ok(version)
    })
}

/// Copy `parent`'s resolved leaves and working elements into new change sets.
fn branch_from(lix: &mut Lix, parent: &Version) -> Result<(String, String)> {
    let leaves = leaf::resolve_leaves(lix, &parent.change_set_id, TraversalMode::Recursive)?;
    let committed = graph::create_change_set(
        lix,
        CreateChangeSetOptions {
            change_ids: leaves.values().map(|leaf| leaf.change.id.clone()).collect(),
            parents: vec![parent.change_set_id.clone()],
            ..Default::default()
        },
    )?;

    let staged = lix
        .store
        .change_set_elements(&parent.working_change_set_id)?;
    let working = graph::create_change_set(
        lix,
        CreateChangeSetOptions {
            change_ids: staged.into_iter().map(|element| element.change_id).collect(),
            ..Default::default()
        },
    )?;
    Ok((committed.id, working.id))
}

fn id_suffix(id: &str) -> &str {
    let start = id
        .char_indices()
        .rev()
        .nth(7)
        .map(|(index, _)| index)
        .unwrap_or(0);
    &id[start..]
}

pub fn get_version(lix: &Lix, version_id: &str) -> Result<Version> {
    lix.store()
        .version(version_id)?
        .ok_or_else(|| Error::not_found("version", version_id))
}

pub fn find_version_by_name(lix: &Lix, name: &str) -> Result<Option<Version>> {
    Ok(lix
        .store()
        .versions()?
        .into_iter()
        .find(|version| version.name == name))
}

pub fn list_versions(lix: &Lix, include_hidden: bool) -> Result<Vec<Version>> {
    Ok(lix
        .store()
        .versions()?
        .into_iter()
        .filter(|version| include_hidden || !version.hidden)
        .collect())
}

/// Move a version's committed pointer, failing with `StaleVersion` when it
/// no longer points at `expected_change_set_id`.
pub fn advance_version(
    lix: &mut Lix,
    version_id: &str,
    expected_change_set_id: &str,
    new_change_set_id: &str,
    new_working_change_set_id: Option<String>,
) -> Result<Version> {
    let version = lix.transaction(|lix| {
        let mut version = get_version(lix, version_id)?;
        if version.change_set_id != expected_change_set_id {
            return Err(Error::StaleVersion {
                version_id: version.id,
                expected: expected_change_set_id.to_string(),
                actual: version.change_set_id,
            });
        }
        if lix.store.change_set(new_change_set_id)?.is_none() {
            return Err(Error::not_found("change set", new_change_set_id));
        }
        version.change_set_id = new_change_set_id.to_string();
        if let Some(working) = new_working_change_set_id {
            version.working_change_set_id = working;
        }
        lix.store.upsert_version(version.clone())?;
        Ok(version)
    })?;
    info!(
        version = %version.id,
        from = expected_change_set_id,
        to = %version.change_set_id,
        "advanced version"
    );
    Ok(version)
}

/// Append a change and stage it in the version's working change set,
/// replacing any staged change for the same entity.
pub fn stage_entity(lix: &mut Lix, version_id: &str, new_change: NewChange) -> Result<Change> {
    lix.transaction(|lix| {
        let version = get_version(lix, version_id)?;
        let change = change::append_change(lix, new_change)?;
        lix.store.put_working_element(ChangeSetElement::from_change(
            &version.working_change_set_id,
            &change,
        ))?;
        Ok(change)
    })
}

/// Staged elements of a version.
pub fn working_elements(lix: &Lix, version_id: &str) -> Result<Vec<ChangeSetElement>> {
    let version = get_version(lix, version_id)?;
    lix.store()
        .change_set_elements(&version.working_change_set_id)
}

/// Promote the working change set to a committed child of the version's
/// change set. `None` when nothing is staged.
pub fn commit_version(
    lix: &mut Lix,
    version_id: &str,
    labels: &[&str],
) -> Result<Option<ChangeSet>> {
    lix.transaction(|lix| {
        let version = get_version(lix, version_id)?;
        let staged = lix
            .store
            .change_set_elements(&version.working_change_set_id)?;
        if staged.is_empty() {
            return Ok(None);
        }

        graph::add_edge(lix, &version.change_set_id, &version.working_change_set_id)?;
        for name in labels {
            label::attach_label(lix, &version.working_change_set_id, name)?;
        }
        let fresh = graph::create_change_set(lix, CreateChangeSetOptions::default())?;
        advance_version(
            lix,
            &version.id,
            &version.change_set_id,
            &version.working_change_set_id,
            Some(fresh.id),
        )?;
        debug!(
            version = %version.id,
            change_set = %version.working_change_set_id,
            elements = staged.len(),
            "committed working change set"
        );
        Ok(Some(ChangeSet {
            id: version.working_change_set_id,
        }))
    })
}

/// Commit and label the result as a checkpoint.
pub fn create_checkpoint(lix: &mut Lix, version_id: &str) -> Result<Option<ChangeSet>> {
    commit_version(lix, version_id, &[CHECKPOINT_LABEL])
}

/// Stage the direct elements of `change_set_id` (e.g. an undo patch) and
/// commit them on top of the version.
pub fn apply_change_set(
    lix: &mut Lix,
    version_id: &str,
    change_set_id: &str,
) -> Result<Option<ChangeSet>> {
    lix.transaction(|lix| {
        let version = get_version(lix, version_id)?;
        for element in lix.store.change_set_elements(change_set_id)? {
            let change = change::get_change(lix, &element.change_id)?;
            lix.store.put_working_element(ChangeSetElement::from_change(
                &version.working_change_set_id,
                &change,
            ))?;
        }
        commit_version(lix, version_id, &[])
    })
}

/// Leaves of a version: committed history overlaid with staged changes,
/// then inherited versions for keys still missing. Deletions are kept so
/// that they hide inherited entities.
pub fn version_leaves(lix: &Lix, version_id: &str) -> Result<BTreeMap<EntityKey, LeafChange>> {
    let mut leaves = BTreeMap::new();
    let mut visited = BTreeSet::new();
    let mut next = Some(version_id.to_string());

    while let Some(current) = next.take() {
        if !visited.insert(current.clone()) {
            break;
        }
        let version = get_version(lix, &current)?;
        let mut own =
            leaf::resolve_leaves(lix, &version.change_set_id, TraversalMode::Recursive)?;
        for element in lix
            .store()
            .change_set_elements(&version.working_change_set_id)?
        {
            let change = change::get_change(lix, &element.change_id)?;
            own.insert(
                element.key(),
                LeafChange {
                    change,
                    change_set_id: version.working_change_set_id.clone(),
                    depth: 0,
                },
            );
        }
        for (key, leaf) in own {
            leaves.entry(key).or_insert(leaf);
        }
        next = version.inherits_from_version_id;
    }
    Ok(leaves)
}

/// A visible entity with its content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    pub change: Change,
    pub content: Value,
}

/// Entities visible in a version; deleted entities are omitted.
pub fn version_state(lix: &Lix, version_id: &str) -> Result<BTreeMap<EntityKey, ResolvedEntity>> {
    let mut state = BTreeMap::new();
    for (key, leaf) in version_leaves(lix, version_id)? {
        if let Some(content) = change::change_content(lix, &leaf.change)? {
            state.insert(
                key,
                ResolvedEntity {
                    change: leaf.change,
                    content,
                },
            );
        }
    }
    Ok(state)
}
