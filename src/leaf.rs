//! Leaf resolution: the single visible change per entity within an
//! ancestry scope.
//!
//! Candidates for a key are all elements for that key in the scope. Selection:
//!
//! 1. A candidate is shadowed when another candidate's change set has the
//!    candidate's change set among its ancestors. A descendant was committed
//!    with the ancestor's state in view, so it supersedes it.
//! 2. Among the remaining (concurrent) candidates the greatest `created_at`
//!    wins.
//! 3. Equal timestamps: the candidate fewer hops from the start wins.
//! 4. Still tied: the lexicographically smallest change id wins.
//!
//! Deletions are ordinary leaves; callers treat them as absent entities.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::graph::{self, Ancestry};
use crate::model::{Change, EntityKey};

/// Which change sets are in scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraversalMode {
    /// Only the starting change set's own elements.
    #[serde(rename = "self")]
    SelfOnly,
    /// The starting change set plus every ancestor.
    #[default]
    Recursive,
}

/// The visible change for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafChange {
    pub change: Change,
    /// Change set holding the winning element.
    pub change_set_id: String,
    /// Hops from the starting change set.
    pub depth: usize,
}

impl LeafChange {
    pub fn key(&self) -> EntityKey {
        self.change.key()
    }

    pub fn is_deletion(&self) -> bool {
        self.change.is_deletion()
    }
}

pub type LeafSet = BTreeMap<EntityKey, LeafChange>;

/// Resolve every entity visible from `change_set_id`.
pub fn resolve_leaves(lix: &Lix, change_set_id: &str, mode: TraversalMode) -> Result<LeafSet> {
    let candidates = collect_candidates(lix, change_set_id, mode, None)?;
    let mut leaves = LeafSet::new();
    for (key, group) in candidates {
        if let Some(leaf) = select_leaf(lix, group)? {
            leaves.insert(key, leaf);
        }
    }
    Ok(leaves)
}

/// Resolve a single entity.
pub fn resolve_leaf(
    lix: &Lix,
    change_set_id: &str,
    key: &EntityKey,
    mode: TraversalMode,
) -> Result<Option<LeafChange>> {
    let mut candidates = collect_candidates(lix, change_set_id, mode, Some(key))?;
    match candidates.remove(key) {
        Some(group) => select_leaf(lix, group),
        None => Ok(None),
    }
}

/// Every element for `key` in the ancestry of `change_set_id`, nearest first.
pub fn entity_history(lix: &Lix, change_set_id: &str, key: &EntityKey) -> Result<Vec<LeafChange>> {
    let mut candidates =
        collect_candidates(lix, change_set_id, TraversalMode::Recursive, Some(key))?;
    let mut history = candidates.remove(key).unwrap_or_default();
    history.sort_by(|a, b| {
        a.depth
            .cmp(&b.depth)
            .then_with(|| b.change.created_at.cmp(&a.change.created_at))
            .then_with(|| a.change.id.cmp(&b.change.id))
    });
    Ok(history)
}

/// Ids of every change held by `change_set_id` or one of its ancestors.
pub fn changes_in_scope(lix: &Lix, change_set_id: &str) -> Result<HashSet<String>> {
    let mut seen = HashSet::new();
    for node in graph::ancestors(lix, change_set_id)?.keys() {
        for element in lix.store().change_set_elements(node)? {
            seen.insert(element.change_id);
        }
    }
    Ok(seen)
}

fn scope(lix: &Lix, change_set_id: &str, mode: TraversalMode) -> Result<Ancestry> {
    match mode {
        TraversalMode::SelfOnly => {
            if lix.store().change_set(change_set_id)?.is_none() {
                return Err(Error::not_found("change set", change_set_id));
            }
            let mut only = Ancestry::new();
            only.insert(change_set_id.to_string(), 0);
            Ok(only)
        }
        TraversalMode::Recursive => Ok(graph::ancestors(lix, change_set_id)?.as_ref().clone()),
    }
}

fn collect_candidates(
    lix: &Lix,
    change_set_id: &str,
    mode: TraversalMode,
    only: Option<&EntityKey>,
) -> Result<BTreeMap<EntityKey, Vec<LeafChange>>> {
    let mut candidates: BTreeMap<EntityKey, Vec<LeafChange>> = BTreeMap::new();
    for (node, depth) in scope(lix, change_set_id, mode)? {
        for element in lix.store().change_set_elements(&node)? {
            let key = element.key();
            if only.is_some_and(|wanted| *wanted != key) {
                continue;
            }
            let change = lix
                .store()
                .change(&element.change_id)?
                .ok_or_else(|| Error::not_found("change", &element.change_id))?;
            candidates.entry(key).or_default().push(LeafChange {
                change,
                change_set_id: node.clone(),
                depth,
            });
        }
    }
    Ok(candidates)
}

fn select_leaf(lix: &Lix, mut group: Vec<LeafChange>) -> Result<Option<LeafChange>> {
    if group.len() <= 1 {
        return Ok(group.pop());
    }

    let holders: BTreeSet<&str> = group
        .iter()
        .map(|candidate| candidate.change_set_id.as_str())
        .collect();
    let shadowed = if holders.len() > 1 {
        shadowed_holders(lix, &holders)?
    } else {
        HashSet::new()
    };

    Ok(group
        .iter()
        .filter(|candidate| !shadowed.contains(candidate.change_set_id.as_str()))
        .min_by(|a, b| precedence(a, b))
        .cloned())
}

/// Holders that are strict ancestors of another holder.
///
/// One parent walk seeded with every holder's parents; each change set in
/// the scope is visited at most once per entity.
fn shadowed_holders(lix: &Lix, holders: &BTreeSet<&str>) -> Result<HashSet<String>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<String> = VecDeque::new();
    for holder in holders {
        queue.push_back((*holder).to_string());
    }

    while let Some(node) = queue.pop_front() {
        for edge in lix.store().parent_edges(&node)? {
            if seen.insert(edge.parent_id.clone()) {
                queue.push_back(edge.parent_id);
            }
        }
    }

    seen.retain(|id| holders.contains(id.as_str()));
    Ok(seen)
}

/// `Less` means `a` wins.
fn precedence(a: &LeafChange, b: &LeafChange) -> Ordering {
    b.change
        .created_at
        .cmp(&a.change.created_at)
        .then_with(|| a.depth.cmp(&b.depth))
        .then_with(|| a.change.id.cmp(&b.change.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NO_CONTENT_SNAPSHOT_ID;
    use chrono::{DateTime, Duration, Utc};

    fn leaf(id: &str, at_ms: i64, depth: usize) -> LeafChange {
        LeafChange {
            change: Change {
                id: id.to_string(),
                entity_id: "e".to_string(),
                file_id: "f".to_string(),
                schema_key: "s".to_string(),
                schema_version: "1.0".to_string(),
                plugin_key: "p".to_string(),
                snapshot_id: NO_CONTENT_SNAPSHOT_ID.to_string(),
                created_at: DateTime::<Utc>::UNIX_EPOCH + Duration::milliseconds(at_ms),
            },
            change_set_id: format!("cs-{id}"),
            depth,
        }
    }

    #[test]
    fn newer_change_wins() {
        let a = leaf("a", 10, 0);
        let b = leaf("b", 20, 3);
        assert_eq!(precedence(&b, &a), Ordering::Less);
    }

    #[test]
    fn equal_time_prefers_nearer() {
        let near = leaf("z", 10, 1);
        let far = leaf("a", 10, 2);
        assert_eq!(precedence(&near, &far), Ordering::Less);
    }

    #[test]
    fn full_tie_prefers_smaller_id() {
        let a = leaf("a", 10, 1);
        let b = leaf("b", 10, 1);
        assert_eq!(precedence(&a, &b), Ordering::Less);
    }

    #[test]
    fn long_history_resolves_with_one_cached_closure() {
        use crate::change::{append_change, NewChange};
        use crate::graph::{create_change_set, CreateChangeSetOptions};

        let mut config = crate::config::LixConfig::default();
        config.clock.deterministic = true;
        let mut lix = Lix::open(config).unwrap();

        let mut head: Option<String> = None;
        let mut last_change = String::new();
        for step in 0..1500 {
            let change = append_change(
                &mut lix,
                NewChange::new("counter", "f", "s", Some(serde_json::json!(step))),
            )
            .unwrap();
            let change_set = create_change_set(
                &mut lix,
                CreateChangeSetOptions {
                    change_ids: vec![change.id.clone()],
                    parents: head.iter().cloned().collect(),
                    ..Default::default()
                },
            )
            .unwrap();
            head = Some(change_set.id);
            last_change = change.id;
        }
        let head = head.unwrap();

        lix.ancestry.borrow_mut().clear();
        let leaves = resolve_leaves(&lix, &head, TraversalMode::Recursive).unwrap();
        assert_eq!(leaves.len(), 1);
        let leaf = leaves.values().next().unwrap();
        assert_eq!(leaf.change.id, last_change);
        assert_eq!(leaf.depth, 0);
        assert_eq!(lix.ancestry.borrow().len(), 1);
    }

    #[test]
    fn shadowing_ignores_timestamps_along_a_path() {
        let mut config = crate::config::LixConfig::default();
        config.clock.deterministic = true;
        let mut lix = Lix::open(config).unwrap();
        let newer = leaf("newer", 50, 1);
        let older = leaf("older", 10, 0);
        for (candidate, parents) in [(&newer, vec![]), (&older, vec![newer.change_set_id.clone()])] {
            lix.store
                .insert_change_set(
                    crate::model::ChangeSet {
                        id: candidate.change_set_id.clone(),
                    },
                    Vec::new(),
                    parents
                        .into_iter()
                        .map(|parent_id| crate::model::ChangeSetEdge {
                            parent_id,
                            child_id: candidate.change_set_id.clone(),
                        })
                        .collect(),
                )
                .unwrap();
        }

        let winner = select_leaf(&lix, vec![newer.clone(), older.clone()]).unwrap();
        assert_eq!(winner, Some(older));
    }

    #[test]
    fn traversal_mode_serializes_like_tagged_object() {
        let json = serde_json::to_value(TraversalMode::SelfOnly).unwrap();
        assert_eq!(json, serde_json::json!({"type": "self"}));
        let mode: TraversalMode =
            serde_json::from_value(serde_json::json!({"type": "recursive"})).unwrap();
        assert_eq!(mode, TraversalMode::Recursive);
    }
}
