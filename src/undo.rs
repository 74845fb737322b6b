//! Undo by inversion.
//!
//! Undoing a change set synthesizes one new change per entity it touched:
//! either the entity's prior state, resolved from the single parent, or a
//! deletion when the entity did not exist before. The changes are packaged
//! as a parentless patch to be applied on top of a version.

use serde::Serialize;
use tracing::info;

use crate::change;
use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::graph::{self, CreateChangeSetOptions};
use crate::leaf::{self, TraversalMode};
use crate::model::{ChangeSet, EntityKey, NO_CONTENT_SNAPSHOT_ID};

/// Summary of an undo patch.
#[derive(Debug, Clone, Serialize)]
pub struct UndoPatch {
    pub change_set: ChangeSet,
    /// Entities put back to their state in the parent.
    pub restored: Vec<EntityKey>,
    /// Entities that did not exist in the parent.
    pub deleted: Vec<EntityKey>,
}

/// Build the inverse of `change_set_id` relative to its only parent.
///
/// Change sets with two or more parents are rejected with
/// `UnsupportedMergeTopology` before anything is written.
pub fn create_undo_change_set(lix: &mut Lix, change_set_id: &str) -> Result<UndoPatch> {
    let parents = graph::parents(lix, change_set_id)?;
    if parents.len() > 1 {
        return Err(Error::UnsupportedMergeTopology {
            change_set_id: change_set_id.to_string(),
            parents: parents.len(),
        });
    }
    let parent = parents.into_iter().next();

    let patch = lix.transaction(|lix| {
        let mut change_ids = Vec::new();
        let mut restored = Vec::new();
        let mut deleted = Vec::new();

        for element in graph::elements(lix, change_set_id)? {
            let undone = change::get_change(lix, &element.change_id)?;
            let key = element.key();
            let prior = match &parent {
                Some(parent) => leaf::resolve_leaf(lix, parent, &key, TraversalMode::Recursive)?
                    .filter(|leaf| !leaf.is_deletion()),
                None => None,
            };

            let inverse = match prior {
                Some(prior) => {
                    restored.push(key);
                    change::append_with_snapshot(lix, &prior.change, &prior.change.snapshot_id)?
                }
                None => {
                    deleted.push(key);
                    change::append_with_snapshot(lix, &undone, NO_CONTENT_SNAPSHOT_ID)?
                }
            };
            change_ids.push(inverse.id);
        }

        let change_set = graph::create_change_set(
            lix,
            CreateChangeSetOptions {
                change_ids,
                ..Default::default()
            },
        )?;
        Ok(UndoPatch {
            change_set,
            restored,
            deleted,
        })
    })?;

    info!(
        undone = change_set_id,
        patch = %patch.change_set.id,
        restored = patch.restored.len(),
        deleted = patch.deleted.len(),
        "created undo change set"
    );
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{append_change, NewChange};
    use serde_json::json;

    fn commit(lix: &mut Lix, entries: &[(&str, Option<&str>)], parents: Vec<String>) -> ChangeSet {
        let mut change_ids = Vec::new();
        for (entity, value) in entries {
            let content = value.map(|value| json!(value));
            let change =
                append_change(lix, NewChange::new(*entity, "file", "thing", content)).unwrap();
            change_ids.push(change.id);
        }
        graph::create_change_set(
            lix,
            CreateChangeSetOptions {
                change_ids,
                parents,
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn root_change_set_undoes_to_deletions() {
        let mut lix = Lix::open_in_memory().unwrap();
        let root = commit(&mut lix, &[("a", Some("1")), ("b", Some("2"))], vec![]);
        let patch = create_undo_change_set(&mut lix, &root.id).unwrap();
        assert_eq!(patch.deleted.len(), 2);
        assert!(patch.restored.is_empty());
        assert!(graph::parents(&lix, &patch.change_set.id).unwrap().is_empty());
    }

    #[test]
    fn prior_state_is_found_through_ancestry() {
        let mut lix = Lix::open_in_memory().unwrap();
        let first = commit(&mut lix, &[("a", Some("old"))], vec![]);
        let second = commit(&mut lix, &[("b", Some("x"))], vec![first.id.clone()]);
        let third = commit(&mut lix, &[("a", Some("new"))], vec![second.id.clone()]);

        let patch = create_undo_change_set(&mut lix, &third.id).unwrap();
        assert_eq!(patch.restored, vec![EntityKey::new("a", "file", "thing")]);

        let element = &graph::elements(&lix, &patch.change_set.id).unwrap()[0];
        let inverse = change::get_change(&lix, &element.change_id).unwrap();
        assert_eq!(
            change::change_content(&lix, &inverse).unwrap(),
            Some(json!("old"))
        );
    }

    #[test]
    fn merge_change_sets_cannot_be_undone() {
        let mut lix = Lix::open_in_memory().unwrap();
        let left = commit(&mut lix, &[("a", Some("1"))], vec![]);
        let right = commit(&mut lix, &[("b", Some("2"))], vec![]);
        let merge = commit(&mut lix, &[], vec![left.id, right.id]);
        let before = lix.store().change_set_ids().unwrap().len();

        let result = create_undo_change_set(&mut lix, &merge.id);
        assert!(matches!(
            result,
            Err(Error::UnsupportedMergeTopology { parents: 2, .. })
        ));
        assert_eq!(lix.store().change_set_ids().unwrap().len(), before);
    }
}
