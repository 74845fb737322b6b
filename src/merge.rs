//! Source-wins merge.
//!
//! A merge commit holds every source leaf plus the target leaves whose keys
//! the source does not hold, and has both inputs as parents. Divergence
//! detection is separate and only records conflicts; it never blocks.

use serde::Serialize;
use tracing::{debug, info};

use crate::conflict::{self, DIVERGENT_EDIT_KEY};
use crate::engine::Lix;
use crate::error::Result;
use crate::graph::{self, CreateChangeSetOptions};
use crate::leaf::{self, TraversalMode};
use crate::model::{ChangeConflict, ChangeSet, EntityKey};
use crate::version;

/// Build the two-parent merge commit of `source` and `target`.
pub fn create_merge_commit(
    lix: &mut Lix,
    source_change_set_id: &str,
    target_change_set_id: &str,
) -> Result<ChangeSet> {
    lix.transaction(|lix| {
        let mut merged =
            leaf::resolve_leaves(lix, source_change_set_id, TraversalMode::Recursive)?;
        let target = leaf::resolve_leaves(lix, target_change_set_id, TraversalMode::Recursive)?;
        let from_source = merged.len();
        for (key, leaf) in target {
            merged.entry(key).or_insert(leaf);
        }

        let change_set = graph::create_change_set(
            lix,
            CreateChangeSetOptions {
                change_ids: merged.values().map(|leaf| leaf.change.id.clone()).collect(),
                parents: vec![
                    source_change_set_id.to_string(),
                    target_change_set_id.to_string(),
                ],
                ..Default::default()
            },
        )?;
        debug!(
            change_set = %change_set.id,
            source = source_change_set_id,
            target = target_change_set_id,
            from_source,
            from_target = merged.len() - from_source,
            "created merge commit"
        );
        Ok(change_set)
    })
}

/// How the two sides of a divergent entity disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DivergenceKind {
    /// Both sides hold content.
    Content,
    /// One side deleted, the other edited.
    ModifyDelete,
    /// Both sides deleted through different changes.
    DeleteDelete,
}

/// An entity both sides changed without seeing the other's change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub key: EntityKey,
    pub source_change_id: String,
    pub target_change_id: String,
    pub kind: DivergenceKind,
}

/// Keys whose leaves differ and where neither leaf appears in the other
/// side's history.
pub fn divergent_entities(
    lix: &Lix,
    source_change_set_id: &str,
    target_change_set_id: &str,
) -> Result<Vec<Divergence>> {
    let source = leaf::resolve_leaves(lix, source_change_set_id, TraversalMode::Recursive)?;
    let target = leaf::resolve_leaves(lix, target_change_set_id, TraversalMode::Recursive)?;

    let seen_by_source = leaf::changes_in_scope(lix, source_change_set_id)?;
    let seen_by_target = leaf::changes_in_scope(lix, target_change_set_id)?;

    let mut divergent = Vec::new();
    for (key, source_leaf) in &source {
        let Some(target_leaf) = target.get(key) else {
            continue;
        };
        if source_leaf.change.id == target_leaf.change.id {
            continue;
        }
        if seen_by_target.contains(&source_leaf.change.id)
            || seen_by_source.contains(&target_leaf.change.id)
        {
            continue;
        }

        let kind = match (source_leaf.is_deletion(), target_leaf.is_deletion()) {
            (false, false) => DivergenceKind::Content,
            (true, true) => DivergenceKind::DeleteDelete,
            _ => DivergenceKind::ModifyDelete,
        };
        divergent.push(Divergence {
            key: key.clone(),
            source_change_id: source_leaf.change.id.clone(),
            target_change_id: target_leaf.change.id.clone(),
            kind,
        });
    }
    Ok(divergent)
}

/// Options for [`merge_version`].
#[derive(Debug, Clone, Default)]
pub struct MergeVersionOptions {
    /// Record each divergent entity as a conflict on the target version.
    pub record_conflicts: bool,
}

/// Outcome of [`merge_version`].
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub change_set: ChangeSet,
    pub divergences: Vec<Divergence>,
    pub conflicts: Vec<ChangeConflict>,
}

/// Merge `source_version_id` into `target_version_id` and advance the target.
pub fn merge_version(
    lix: &mut Lix,
    source_version_id: &str,
    target_version_id: &str,
    options: MergeVersionOptions,
) -> Result<MergeOutcome> {
    let outcome = lix.transaction(|lix| {
        let source = version::get_version(lix, source_version_id)?;
        let target = version::get_version(lix, target_version_id)?;

        let divergences = divergent_entities(lix, &source.change_set_id, &target.change_set_id)?;
        let mut conflicts = Vec::new();
        if options.record_conflicts {
            for divergence in &divergences {
                conflicts.push(conflict::create_change_conflict(
                    lix,
                    DIVERGENT_EDIT_KEY,
                    [
                        divergence.source_change_id.clone(),
                        divergence.target_change_id.clone(),
                    ],
                    &target.id,
                )?);
            }
        }

        let change_set = create_merge_commit(lix, &source.change_set_id, &target.change_set_id)?;
        version::advance_version(
            lix,
            &target.id,
            &target.change_set_id,
            &change_set.id,
            None,
        )?;
        Ok(MergeOutcome {
            change_set,
            divergences,
            conflicts,
        })
    })?;
    info!(
        source = source_version_id,
        target = target_version_id,
        change_set = %outcome.change_set.id,
        divergent = outcome.divergences.len(),
        "merged versions"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{append_change, NewChange};
    use serde_json::json;

    fn change_set_with(lix: &mut Lix, entries: &[(&str, &str)], parents: Vec<String>) -> ChangeSet {
        let entries: Vec<(&str, Option<&str>)> =
            entries.iter().map(|(entity, value)| (*entity, Some(*value))).collect();
        change_set_of(lix, &entries, parents)
    }

    /// `None` values record deletions.
    fn change_set_of(
        lix: &mut Lix,
        entries: &[(&str, Option<&str>)],
        parents: Vec<String>,
    ) -> ChangeSet {
        let mut change_ids = Vec::new();
        for (entity, value) in entries {
            let change = append_change(
                lix,
                NewChange::new(*entity, "file", "thing", value.map(|value| json!(value))),
            )
            .unwrap();
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
    fn merge_commit_has_both_parents() {
        let mut lix = Lix::open_in_memory().unwrap();
        let source = change_set_with(&mut lix, &[("a", "1")], vec![]);
        let target = change_set_with(&mut lix, &[("b", "2")], vec![]);
        let merged = create_merge_commit(&mut lix, &source.id, &target.id).unwrap();

        let mut parents = graph::parents(&lix, &merged.id).unwrap();
        parents.sort();
        let mut expected = vec![source.id, target.id];
        expected.sort();
        assert_eq!(parents, expected);
        assert_eq!(graph::elements(&lix, &merged.id).unwrap().len(), 2);
    }

    #[test]
    fn independent_edits_diverge() {
        let mut lix = Lix::open_in_memory().unwrap();
        let base = change_set_with(&mut lix, &[("a", "base")], vec![]);
        let left = change_set_with(&mut lix, &[("a", "left")], vec![base.id.clone()]);
        let right = change_set_with(&mut lix, &[("a", "right")], vec![base.id.clone()]);

        let divergent = divergent_entities(&lix, &left.id, &right.id).unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].kind, DivergenceKind::Content);

        // The right side already contains everything the base says.
        assert!(divergent_entities(&lix, &base.id, &right.id)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_against_edit_is_modify_delete() {
        let mut lix = Lix::open_in_memory().unwrap();
        let base = change_set_with(&mut lix, &[("a", "base")], vec![]);
        let deleted = change_set_of(&mut lix, &[("a", None)], vec![base.id.clone()]);
        let edited = change_set_of(&mut lix, &[("a", Some("edit"))], vec![base.id.clone()]);

        for (source, target) in [(&deleted, &edited), (&edited, &deleted)] {
            let divergent = divergent_entities(&lix, &source.id, &target.id).unwrap();
            assert_eq!(divergent.len(), 1);
            assert_eq!(divergent[0].kind, DivergenceKind::ModifyDelete);
        }
    }

    #[test]
    fn separate_deletions_are_delete_delete() {
        let mut lix = Lix::open_in_memory().unwrap();
        let base = change_set_with(&mut lix, &[("a", "base")], vec![]);
        let left = change_set_of(&mut lix, &[("a", None)], vec![base.id.clone()]);
        let right = change_set_of(&mut lix, &[("a", None)], vec![base.id.clone()]);

        let divergent = divergent_entities(&lix, &left.id, &right.id).unwrap();
        assert_eq!(divergent.len(), 1);
        assert_eq!(divergent[0].kind, DivergenceKind::DeleteDelete);
        assert_ne!(divergent[0].source_change_id, divergent[0].target_change_id);

        // A side that already saw the deletion does not diverge.
        let after = change_set_of(&mut lix, &[("b", Some("x"))], vec![left.id.clone()]);
        assert!(divergent_entities(&lix, &left.id, &after.id)
            .unwrap()
            .is_empty());
    }
}
