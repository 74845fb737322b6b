//! Change graph: change sets as DAG nodes linked by parent edges.
//!
//! Nodes and edges live in the store as id-keyed rows. Ancestry is computed
//! by [`reachable`], a plain BFS over any parent relation, and memoized per
//! starting change set in a bounded [`AncestryCache`].

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::model::{ChangeSet, ChangeSetEdge, ChangeSetElement, EntityKey};
use crate::store::StateStore;

/// Change set id -> hop distance from the start (the start itself is 0).
pub type Ancestry = BTreeMap<String, usize>;

/// Closures kept by default before the oldest is evicted.
pub const DEFAULT_ANCESTRY_CACHE_ENTRIES: usize = 256;

/// Memoized ancestor closures keyed by starting change set, evicted oldest
/// first once `capacity` closures are held.
#[derive(Debug)]
pub struct AncestryCache {
    closures: HashMap<String, Arc<Ancestry>>,
    order: VecDeque<String>,
    capacity: usize,
}

impl Default for AncestryCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ANCESTRY_CACHE_ENTRIES)
    }
}

impl AncestryCache {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            closures: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Ancestry>> {
        self.closures.get(id).cloned()
    }

    pub fn insert(&mut self, id: &str, closure: Arc<Ancestry>) {
        if !self.closures.contains_key(id) {
            while self.closures.len() >= self.capacity {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                self.closures.remove(&oldest);
            }
            self.order.push_back(id.to_string());
        }
        self.closures.insert(id.to_string(), closure);
    }

    /// Drop every closure that contains `child`; an edge into `child`
    /// extends exactly those.
    pub fn invalidate_through(&mut self, child: &str) {
        self.closures.retain(|_, closure| !closure.contains_key(child));
        let closures = &self.closures;
        self.order.retain(|id| closures.contains_key(id));
    }

    pub fn clear(&mut self) {
        self.closures.clear();
        self.order.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.closures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closures.is_empty()
    }
}

/// Every node reachable from `start` by repeatedly following `parents_of`,
/// with its minimum hop distance. Terminates on any finite relation, cyclic
/// or not.
pub fn reachable<F, E>(start: &str, mut parents_of: F) -> std::result::Result<Ancestry, E>
where
    F: FnMut(&str) -> std::result::Result<Vec<String>, E>,
{
    let mut seen = Ancestry::new();
    let mut queue = VecDeque::new();
    seen.insert(start.to_string(), 0);
    queue.push_back((start.to_string(), 0usize));

    while let Some((node, distance)) = queue.pop_front() {
        for parent in parents_of(&node)? {
            if seen.contains_key(&parent) {
                continue;
            }
            seen.insert(parent.clone(), distance + 1);
            queue.push_back((parent, distance + 1));
        }
    }

    Ok(seen)
}

/// [`reachable`] over a plain edge list.
pub fn reachable_in_edges(start: &str, edges: &[ChangeSetEdge]) -> Ancestry {
    let mut index: HashMap<&str, Vec<String>> = HashMap::new();
    for edge in edges {
        index
            .entry(edge.child_id.as_str())
            .or_default()
            .push(edge.parent_id.clone());
    }
    let result: std::result::Result<Ancestry, std::convert::Infallible> =
        reachable(start, |node| Ok(index.get(node).cloned().unwrap_or_default()));
    match result {
        Ok(ancestry) => ancestry,
        Err(never) => match never {},
    }
}

/// Input for [`create_change_set`].
#[derive(Debug, Clone, Default)]
pub struct CreateChangeSetOptions {
    /// Explicit id; drawn from the clock when absent.
    pub id: Option<String>,
    /// Changes to include, at most one per entity key.
    pub change_ids: Vec<String>,
    pub parents: Vec<String>,
    /// Label names, created on first use.
    pub labels: Vec<String>,
}

/// Validate and insert a new immutable change set with its parent edges.
///
/// Nothing is written when a parent is missing, a change is unknown or two
/// changes target the same entity key.
pub fn create_change_set(lix: &mut Lix, options: CreateChangeSetOptions) -> Result<ChangeSet> {
    lix.transaction(|lix| {
        let id = match options.id {
            Some(id) => id,
            None => lix.next_id()?,
        };
        if lix.store.change_set(&id)?.is_some() {
            return Err(Error::GraphIntegrity(format!(
                "change set {id} already exists"
            )));
        }

        let mut parents = Vec::new();
        for parent in options.parents {
            if lix.store.change_set(&parent)?.is_none() {
                return Err(Error::GraphIntegrity(format!(
                    "parent change set {parent} does not exist"
                )));
            }
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }

        let mut keys = BTreeSet::new();
        let mut elements = Vec::with_capacity(options.change_ids.len());
        for change_id in &options.change_ids {
            let change = lix
                .store
                .change(change_id)?
                .ok_or_else(|| Error::not_found("change", change_id))?;
            let key = change.key();
            if !keys.insert(key.clone()) {
                return Err(duplicate_element(&id, &key));
            }
            elements.push(ChangeSetElement::from_change(&id, &change));
        }

        let edges = parents
            .iter()
            .map(|parent| ChangeSetEdge {
                parent_id: parent.clone(),
                child_id: id.clone(),
            })
            .collect();

        let change_set = ChangeSet { id: id.clone() };
        lix.store
            .insert_change_set(change_set.clone(), elements, edges)?;

        for label in &options.labels {
            let label = crate::label::create_label(lix, label)?;
            lix.store.attach_label(&id, &label.id)?;
        }

        debug!(
            change_set = %id,
            parents = parents.len(),
            elements = keys.len(),
            "created change set"
        );
        Ok(change_set)
    })
}

fn duplicate_element(change_set_id: &str, key: &EntityKey) -> Error {
    Error::DuplicateElement {
        change_set_id: change_set_id.to_string(),
        entity_id: key.entity_id.clone(),
        file_id: key.file_id.clone(),
        schema_key: key.schema_key.clone(),
    }
}

/// Link two existing change sets. Rejects self loops and edges that would
/// close a cycle.
pub fn add_edge(lix: &mut Lix, parent_id: &str, child_id: &str) -> Result<()> {
    for id in [parent_id, child_id] {
        if lix.store.change_set(id)?.is_none() {
            return Err(Error::GraphIntegrity(format!(
                "edge references missing change set {id}"
            )));
        }
    }
    if parent_id == child_id || ancestors(lix, parent_id)?.contains_key(child_id) {
        return Err(Error::GraphIntegrity(format!(
            "edge {parent_id} -> {child_id} would create a cycle"
        )));
    }

    lix.transaction(|lix| {
        lix.store.insert_edge(ChangeSetEdge {
            parent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
        })
    })?;
    lix.ancestry.borrow_mut().invalidate_through(child_id);
    debug!(parent = parent_id, child = child_id, "added edge");
    Ok(())
}

fn require_change_set(store: &dyn StateStore, id: &str) -> Result<()> {
    match store.change_set(id)? {
        Some(_) => Ok(()),
        None => Err(Error::not_found("change set", id)),
    }
}

fn parent_ids(store: &dyn StateStore, id: &str) -> Result<Vec<String>> {
    Ok(store
        .parent_edges(id)?
        .into_iter()
        .map(|edge| edge.parent_id)
        .collect())
}

/// Direct parents of a change set.
pub fn parents(lix: &Lix, change_set_id: &str) -> Result<Vec<String>> {
    require_change_set(lix.store(), change_set_id)?;
    parent_ids(lix.store(), change_set_id)
}

/// Direct children of a change set.
pub fn children(lix: &Lix, change_set_id: &str) -> Result<Vec<String>> {
    require_change_set(lix.store(), change_set_id)?;
    Ok(lix
        .store()
        .child_edges(change_set_id)?
        .into_iter()
        .map(|edge| edge.child_id)
        .collect())
}

/// Elements owned directly by a change set.
pub fn elements(lix: &Lix, change_set_id: &str) -> Result<Vec<ChangeSetElement>> {
    lix.store().change_set_elements(change_set_id)
}

/// Ancestor closure of `change_set_id`, including itself at distance 0.
pub fn ancestors(lix: &Lix, change_set_id: &str) -> Result<Arc<Ancestry>> {
    if let Some(hit) = lix.ancestry.borrow().get(change_set_id) {
        return Ok(hit);
    }
    require_change_set(lix.store(), change_set_id)?;
    let closure = Arc::new(reachable(change_set_id, |node| {
        parent_ids(lix.store(), node)
    })?);
    lix.ancestry
        .borrow_mut()
        .insert(change_set_id, Arc::clone(&closure));
    Ok(closure)
}

/// True when `ancestor` is reachable from `descendant` (or equal to it).
pub fn is_ancestor(lix: &Lix, ancestor: &str, descendant: &str) -> Result<bool> {
    Ok(ancestors(lix, descendant)?.contains_key(ancestor))
}

/// Ancestry ordered nearest first, ties by id.
pub fn history(lix: &Lix, change_set_id: &str) -> Result<Vec<(String, usize)>> {
    let closure = ancestors(lix, change_set_id)?;
    let mut entries: Vec<(String, usize)> = closure
        .iter()
        .map(|(id, distance)| (id.clone(), *distance))
        .collect();
    entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(parent: &str, child: &str) -> ChangeSetEdge {
        ChangeSetEdge {
            parent_id: parent.to_string(),
            child_id: child.to_string(),
        }
    }

    #[test]
    fn reachable_reports_minimum_distance() {
        // a <- b <- d, a <- c <- d, a <- d
        let edges = vec![
            edge("a", "b"),
            edge("a", "c"),
            edge("b", "d"),
            edge("c", "d"),
            edge("a", "d"),
        ];
        let closure = reachable_in_edges("d", &edges);
        assert_eq!(closure.get("d"), Some(&0));
        assert_eq!(closure.get("b"), Some(&1));
        assert_eq!(closure.get("c"), Some(&1));
        assert_eq!(closure.get("a"), Some(&1));
        assert_eq!(closure.len(), 4);
    }

    #[test]
    fn reachable_from_root_is_itself() {
        let closure = reachable_in_edges("root", &[edge("root", "x")]);
        assert_eq!(closure.len(), 1);
    }

    #[test]
    fn reachable_terminates_on_cycles() {
        let closure = reachable_in_edges("a", &[edge("a", "b"), edge("b", "a")]);
        assert_eq!(closure.len(), 2);
    }

    #[test]
    fn invalidation_only_drops_affected_closures() {
        let mut cache = AncestryCache::default();
        let mut with_b = Ancestry::new();
        with_b.insert("b".to_string(), 0);
        let mut without_b = Ancestry::new();
        without_b.insert("z".to_string(), 0);
        cache.insert("b", Arc::new(with_b));
        cache.insert("z", Arc::new(without_b));
        cache.invalidate_through("b");
        assert!(cache.get("b").is_none());
        assert!(cache.get("z").is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cache_evicts_oldest_closure_at_capacity() {
        let mut cache = AncestryCache::with_capacity(2);
        for id in ["a", "b", "c"] {
            let mut closure = Ancestry::new();
            closure.insert(id.to_string(), 0);
            cache.insert(id, Arc::new(closure));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());

        cache.invalidate_through("b");
        let mut closure = Ancestry::new();
        closure.insert("d".to_string(), 0);
        cache.insert("d", Arc::new(closure));
        assert!(cache.get("c").is_some());
        assert!(cache.get("d").is_some());
    }
}
