//! State store seam and the bundled in-memory store.
//!
//! The engine only talks to storage through [`StateStore`]. [`MemoryStore`]
//! keeps every table as an id-keyed arena plus parent/child adjacency
//! indexes, and serializes to a single JSON blob.
//!
//! # Tables
//!
//! ```text
//! changes            id -> Change
//! snapshots          id -> Snapshot (content addressed, "no-content" sentinel)
//! change_sets        id -> ChangeSet
//! elements           change_set_id -> [ChangeSetElement]
//! parents/children   change_set_id -> [change_set_id]
//! versions           id -> Version
//! conflicts          id -> ChangeConflict, plus (conflict, version) pointers
//! labels             id -> Label, plus change_set_id -> {label_id}
//! key_values         key -> JSON (active version, clock state)
//! state              version_id -> [StateRow]
//! files              version_id -> file_id -> FileRecord
//! file_descriptors   file_id -> FileDescriptor
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::{
    Change, ChangeConflict, ChangeSet, ChangeSetEdge, ChangeSetElement, ConflictPointer,
    EntityKey, FileDescriptor, FileRecord, Label, Snapshot, StateRow, Version,
};

/// Blob format tag written by [`StateStore::export_blob`].
pub const BLOB_FORMAT: &str = "lix.blob.v1";

/// Storage operations the change-graph core depends on.
///
/// Implementations only persist and look up; integrity rules (duplicate
/// elements, cycles, missing parents) are enforced by the graph layer before
/// anything reaches the store. Transactions are single-level here; nesting is
/// handled by [`crate::Lix::transaction`].
pub trait StateStore: Send {
    // Transactions
    fn in_transaction(&self) -> bool;
    fn begin_transaction(&mut self) -> Result<()>;
    fn commit_transaction(&mut self) -> Result<()>;
    fn rollback_transaction(&mut self) -> Result<()>;

    // Changes and snapshots
    fn append_change(&mut self, change: Change, snapshot: Snapshot) -> Result<String>;
    fn change(&self, id: &str) -> Result<Option<Change>>;
    fn snapshot(&self, id: &str) -> Result<Option<Snapshot>>;

    // Change sets and edges
    fn insert_change_set(
        &mut self,
        change_set: ChangeSet,
        elements: Vec<ChangeSetElement>,
        parent_edges: Vec<ChangeSetEdge>,
    ) -> Result<()>;
    fn change_set(&self, id: &str) -> Result<Option<ChangeSet>>;
    fn change_set_ids(&self) -> Result<Vec<String>>;
    fn change_set_elements(&self, id: &str) -> Result<Vec<ChangeSetElement>>;
    fn parent_edges(&self, id: &str) -> Result<Vec<ChangeSetEdge>>;
    fn child_edges(&self, id: &str) -> Result<Vec<ChangeSetEdge>>;
    fn insert_edge(&mut self, edge: ChangeSetEdge) -> Result<()>;
    /// Place an element in a working change set, replacing any element for the same key.
    fn put_working_element(&mut self, element: ChangeSetElement) -> Result<()>;

    // Versions
    fn upsert_version(&mut self, version: Version) -> Result<()>;
    fn version(&self, id: &str) -> Result<Option<Version>>;
    fn versions(&self) -> Result<Vec<Version>>;

    // Conflicts
    fn insert_conflict(&mut self, conflict: ChangeConflict) -> Result<()>;
    fn conflict(&self, id: &str) -> Result<Option<ChangeConflict>>;
    fn insert_conflict_pointer(&mut self, pointer: ConflictPointer) -> Result<()>;
    fn conflict_pointers(&self, version_id: &str) -> Result<Vec<ConflictPointer>>;

    // Labels
    fn insert_label(&mut self, label: Label) -> Result<()>;
    fn label_by_name(&self, name: &str) -> Result<Option<Label>>;
    fn attach_label(&mut self, change_set_id: &str, label_id: &str) -> Result<()>;
    fn labels_of(&self, change_set_id: &str) -> Result<Vec<Label>>;
    fn change_sets_with_label(&self, label_id: &str) -> Result<Vec<String>>;

    // Key-value rows
    fn kv_get(&self, key: &str) -> Result<Option<Value>>;
    fn kv_set(&mut self, key: &str, value: Value) -> Result<()>;

    // Materialized state and files
    fn replace_state(&mut self, version_id: &str, rows: Vec<StateRow>) -> Result<()>;
    fn state(&self, version_id: &str) -> Result<Vec<StateRow>>;
    fn upsert_file(&mut self, version_id: &str, file: FileRecord) -> Result<()>;
    fn file(&self, version_id: &str, file_id: &str) -> Result<Option<FileRecord>>;
    fn files(&self, version_id: &str) -> Result<Vec<FileRecord>>;
    fn remove_file(&mut self, version_id: &str, file_id: &str) -> Result<()>;
    fn upsert_file_descriptor(&mut self, descriptor: FileDescriptor) -> Result<()>;
    fn file_descriptor(&self, file_id: &str) -> Result<Option<FileDescriptor>>;

    /// Serialize every table, including clock state, into one blob.
    fn export_blob(&self) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    changes: BTreeMap<String, Change>,
    snapshots: BTreeMap<String, Snapshot>,
    change_sets: BTreeMap<String, ChangeSet>,
    elements: BTreeMap<String, Vec<ChangeSetElement>>,
    parents: BTreeMap<String, Vec<String>>,
    children: BTreeMap<String, Vec<String>>,
    versions: BTreeMap<String, Version>,
    conflicts: BTreeMap<String, ChangeConflict>,
    conflict_pointers: BTreeSet<ConflictPointer>,
    labels: BTreeMap<String, Label>,
    change_set_labels: BTreeMap<String, BTreeSet<String>>,
    key_values: BTreeMap<String, Value>,
    state: BTreeMap<String, Vec<StateRow>>,
    files: BTreeMap<String, BTreeMap<String, FileRecord>>,
    file_descriptors: BTreeMap<String, FileDescriptor>,
}

#[derive(Serialize)]
struct BlobEnvelope<'a> {
    format: String,
    data: &'a StoreData,
}

#[derive(Deserialize)]
struct OwnedBlobEnvelope {
    format: String,
    data: StoreData,
}

/// One reversible write, holding the row it overwrote.
#[derive(Debug)]
enum UndoEntry {
    Change(String),
    Snapshot(String),
    ChangeSet {
        id: String,
        previous_elements: Option<Vec<ChangeSetElement>>,
    },
    Edge {
        parent_id: String,
        child_id: String,
    },
    WorkingElement {
        change_set_id: String,
        key: EntityKey,
        replaced: Option<(usize, ChangeSetElement)>,
    },
    Version {
        id: String,
        previous: Option<Version>,
    },
    Conflict {
        id: String,
        previous: Option<ChangeConflict>,
    },
    ConflictPointer(ConflictPointer),
    Label {
        id: String,
        previous: Option<Label>,
    },
    LabelAttachment {
        change_set_id: String,
        label_id: String,
    },
    KeyValue {
        key: String,
        previous: Option<Value>,
    },
    State {
        version_id: String,
        previous: Option<Vec<StateRow>>,
    },
    File {
        version_id: String,
        file_id: String,
        previous: Option<FileRecord>,
    },
    FileDescriptor {
        id: String,
        previous: Option<FileDescriptor>,
    },
}

fn restore<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

fn unlink(index: &mut BTreeMap<String, Vec<String>>, from: &str, to: &str) {
    if let Some(linked) = index.get_mut(from) {
        linked.retain(|id| id != to);
        if linked.is_empty() {
            index.remove(from);
        }
    }
}

impl StoreData {
    fn undo(&mut self, entry: UndoEntry) {
        match entry {
            UndoEntry::Change(id) => {
                self.changes.remove(&id);
            }
            UndoEntry::Snapshot(id) => {
                self.snapshots.remove(&id);
            }
            UndoEntry::ChangeSet {
                id,
                previous_elements,
            } => {
                self.change_sets.remove(&id);
                restore(&mut self.elements, id, previous_elements);
            }
            UndoEntry::Edge {
                parent_id,
                child_id,
            } => {
                unlink(&mut self.parents, &child_id, &parent_id);
                unlink(&mut self.children, &parent_id, &child_id);
            }
            UndoEntry::WorkingElement {
                change_set_id,
                key,
                replaced,
            } => {
                if let Some(elements) = self.elements.get_mut(&change_set_id) {
                    elements.retain(|element| element.key() != key);
                    if let Some((index, element)) = replaced {
                        elements.insert(index.min(elements.len()), element);
                    }
                }
            }
            UndoEntry::Version { id, previous } => restore(&mut self.versions, id, previous),
            UndoEntry::Conflict { id, previous } => restore(&mut self.conflicts, id, previous),
            UndoEntry::ConflictPointer(pointer) => {
                self.conflict_pointers.remove(&pointer);
            }
            UndoEntry::Label { id, previous } => restore(&mut self.labels, id, previous),
            UndoEntry::LabelAttachment {
                change_set_id,
                label_id,
            } => {
                if let Some(labels) = self.change_set_labels.get_mut(&change_set_id) {
                    labels.remove(&label_id);
                    if labels.is_empty() {
                        self.change_set_labels.remove(&change_set_id);
                    }
                }
            }
            UndoEntry::KeyValue { key, previous } => restore(&mut self.key_values, key, previous),
            UndoEntry::State {
                version_id,
                previous,
            } => restore(&mut self.state, version_id, previous),
            UndoEntry::File {
                version_id,
                file_id,
                previous,
            } => {
                let files = self.files.entry(version_id.clone()).or_default();
                restore(files, file_id, previous);
                if files.is_empty() {
                    self.files.remove(&version_id);
                }
            }
            UndoEntry::FileDescriptor { id, previous } => {
                restore(&mut self.file_descriptors, id, previous)
            }
        }
    }
}

/// In-memory [`StateStore`].
///
/// While a transaction is open every write pushes an [`UndoEntry`] onto a
/// journal; rollback replays the journal backwards, so a write costs the
/// size of the row it touches rather than the size of the store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: StoreData,
    journal: Option<Vec<UndoEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut store = Self::default();
        let sentinel = Snapshot::no_content();
        store.data.snapshots.insert(sentinel.id.clone(), sentinel);
        store
    }

    /// Rebuild a store from [`StateStore::export_blob`] output.
    pub fn import_blob(bytes: &[u8]) -> Result<Self> {
        let envelope: OwnedBlobEnvelope = serde_json::from_slice(bytes)
            .map_err(|err| Error::InvalidBlob(format!("cannot decode blob: {err}")))?;
        if envelope.format != BLOB_FORMAT {
            return Err(Error::InvalidBlob(format!(
                "unsupported blob format '{}'",
                envelope.format
            )));
        }
        let mut store = Self {
            data: envelope.data,
            journal: None,
        };
        let sentinel = Snapshot::no_content();
        store.data.snapshots.entry(sentinel.id.clone()).or_insert(sentinel);
        Ok(store)
    }

    /// Undo entries recorded by the open transaction.
    pub fn journal_len(&self) -> usize {
        self.journal.as_ref().map_or(0, Vec::len)
    }

    fn record(&mut self, entry: UndoEntry) {
        if let Some(journal) = self.journal.as_mut() {
            journal.push(entry);
        }
    }

    fn require_change_set(&self, id: &str) -> Result<()> {
        if self.data.change_sets.contains_key(id) {
            Ok(())
        } else {
            Err(Error::not_found("change set", id))
        }
    }
}

impl StateStore for MemoryStore {
    fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn begin_transaction(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(Error::InvalidArgument(
                "a transaction is already open on this store".to_string(),
            ));
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    fn commit_transaction(&mut self) -> Result<()> {
        if self.journal.take().is_none() {
            return Err(Error::InvalidArgument("no open transaction".to_string()));
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> Result<()> {
        let journal = self
            .journal
            .take()
            .ok_or_else(|| Error::InvalidArgument("no open transaction".to_string()))?;
        for entry in journal.into_iter().rev() {
            self.data.undo(entry);
        }
        Ok(())
    }

    fn append_change(&mut self, change: Change, snapshot: Snapshot) -> Result<String> {
        if self.data.changes.contains_key(&change.id) {
            return Err(Error::DuplicateChange(change.id));
        }
        if change.snapshot_id != snapshot.id {
            return Err(Error::InvalidArgument(format!(
                "change {} points at snapshot {} but {} was supplied",
                change.id, change.snapshot_id, snapshot.id
            )));
        }
        if !self.data.snapshots.contains_key(&snapshot.id) {
            self.record(UndoEntry::Snapshot(snapshot.id.clone()));
            self.data.snapshots.insert(snapshot.id.clone(), snapshot);
        }
        let id = change.id.clone();
        self.record(UndoEntry::Change(id.clone()));
        self.data.changes.insert(id.clone(), change);
        Ok(id)
    }

    fn change(&self, id: &str) -> Result<Option<Change>> {
        Ok(self.data.changes.get(id).cloned())
    }

    fn snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        Ok(self.data.snapshots.get(id).cloned())
    }

    fn insert_change_set(
        &mut self,
        change_set: ChangeSet,
        elements: Vec<ChangeSetElement>,
        parent_edges: Vec<ChangeSetEdge>,
    ) -> Result<()> {
        if self.data.change_sets.contains_key(&change_set.id) {
            return Err(Error::GraphIntegrity(format!(
                "change set {} already exists",
                change_set.id
            )));
        }
        let id = change_set.id.clone();
        self.data.change_sets.insert(id.clone(), change_set);
        let previous_elements = self.data.elements.insert(id.clone(), elements);
        self.record(UndoEntry::ChangeSet {
            id,
            previous_elements,
        });
        for edge in parent_edges {
            self.insert_edge(edge)?;
        }
        Ok(())
    }

    fn change_set(&self, id: &str) -> Result<Option<ChangeSet>> {
        Ok(self.data.change_sets.get(id).cloned())
    }

    fn change_set_ids(&self) -> Result<Vec<String>> {
        Ok(self.data.change_sets.keys().cloned().collect())
    }

    fn change_set_elements(&self, id: &str) -> Result<Vec<ChangeSetElement>> {
        self.require_change_set(id)?;
        Ok(self.data.elements.get(id).cloned().unwrap_or_default())
    }

    fn parent_edges(&self, id: &str) -> Result<Vec<ChangeSetEdge>> {
        Ok(self
            .data
            .parents
            .get(id)
            .map(|parents| {
                parents
                    .iter()
                    .map(|parent| ChangeSetEdge {
                        parent_id: parent.clone(),
                        child_id: id.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn child_edges(&self, id: &str) -> Result<Vec<ChangeSetEdge>> {
        Ok(self
            .data
            .children
            .get(id)
            .map(|children| {
                children
                    .iter()
                    .map(|child| ChangeSetEdge {
                        parent_id: id.to_string(),
                        child_id: child.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn insert_edge(&mut self, edge: ChangeSetEdge) -> Result<()> {
        self.require_change_set(&edge.parent_id)?;
        self.require_change_set(&edge.child_id)?;
        let parents = self.data.parents.entry(edge.child_id.clone()).or_default();
        if parents.contains(&edge.parent_id) {
            return Ok(());
        }
        parents.push(edge.parent_id.clone());
        self.data
            .children
            .entry(edge.parent_id.clone())
            .or_default()
            .push(edge.child_id.clone());
        self.record(UndoEntry::Edge {
            parent_id: edge.parent_id,
            child_id: edge.child_id,
        });
        Ok(())
    }

    fn put_working_element(&mut self, element: ChangeSetElement) -> Result<()> {
        self.require_change_set(&element.change_set_id)?;
        let change_set_id = element.change_set_id.clone();
        let key = element.key();
        let elements = self.data.elements.entry(change_set_id.clone()).or_default();
        let position = elements.iter().position(|existing| existing.key() == key);
        let replaced = position.map(|index| (index, elements.remove(index)));
        elements.push(element);
        self.record(UndoEntry::WorkingElement {
            change_set_id,
            key,
            replaced,
        });
        Ok(())
    }

    fn upsert_version(&mut self, version: Version) -> Result<()> {
        let id = version.id.clone();
        let previous = self.data.versions.insert(id.clone(), version);
        self.record(UndoEntry::Version { id, previous });
        Ok(())
    }

    fn version(&self, id: &str) -> Result<Option<Version>> {
        Ok(self.data.versions.get(id).cloned())
    }

    fn versions(&self) -> Result<Vec<Version>> {
        Ok(self.data.versions.values().cloned().collect())
    }

    fn insert_conflict(&mut self, conflict: ChangeConflict) -> Result<()> {
        let id = conflict.id.clone();
        let previous = self.data.conflicts.insert(id.clone(), conflict);
        self.record(UndoEntry::Conflict { id, previous });
        Ok(())
    }

    fn conflict(&self, id: &str) -> Result<Option<ChangeConflict>> {
        Ok(self.data.conflicts.get(id).cloned())
    }

    fn insert_conflict_pointer(&mut self, pointer: ConflictPointer) -> Result<()> {
        if self.data.conflict_pointers.insert(pointer.clone()) {
            self.record(UndoEntry::ConflictPointer(pointer));
        }
        Ok(())
    }

    fn conflict_pointers(&self, version_id: &str) -> Result<Vec<ConflictPointer>> {
        Ok(self
            .data
            .conflict_pointers
            .iter()
            .filter(|pointer| pointer.version_id == version_id)
            .cloned()
            .collect())
    }

    fn insert_label(&mut self, label: Label) -> Result<()> {
        let id = label.id.clone();
        let previous = self.data.labels.insert(id.clone(), label);
        self.record(UndoEntry::Label { id, previous });
        Ok(())
    }

    fn label_by_name(&self, name: &str) -> Result<Option<Label>> {
        Ok(self
            .data
            .labels
            .values()
            .find(|label| label.name == name)
            .cloned())
    }

    fn attach_label(&mut self, change_set_id: &str, label_id: &str) -> Result<()> {
        self.require_change_set(change_set_id)?;
        if !self.data.labels.contains_key(label_id) {
            return Err(Error::not_found("label", label_id));
        }
        let attached = self
            .data
            .change_set_labels
            .entry(change_set_id.to_string())
            .or_default()
            .insert(label_id.to_string());
        if attached {
            self.record(UndoEntry::LabelAttachment {
                change_set_id: change_set_id.to_string(),
                label_id: label_id.to_string(),
            });
        }
        Ok(())
    }

    fn labels_of(&self, change_set_id: &str) -> Result<Vec<Label>> {
        Ok(self
            .data
            .change_set_labels
            .get(change_set_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.data.labels.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn change_sets_with_label(&self, label_id: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .change_set_labels
            .iter()
            .filter(|(_, labels)| labels.contains(label_id))
            .map(|(change_set_id, _)| change_set_id.clone())
            .collect())
    }

    fn kv_get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.data.key_values.get(key).cloned())
    }

    fn kv_set(&mut self, key: &str, value: Value) -> Result<()> {
        let previous = self.data.key_values.insert(key.to_string(), value);
        self.record(UndoEntry::KeyValue {
            key: key.to_string(),
            previous,
        });
        Ok(())
    }

    fn replace_state(&mut self, version_id: &str, rows: Vec<StateRow>) -> Result<()> {
        let previous = self.data.state.insert(version_id.to_string(), rows);
        self.record(UndoEntry::State {
            version_id: version_id.to_string(),
            previous,
        });
        Ok(())
    }

    fn state(&self, version_id: &str) -> Result<Vec<StateRow>> {
        Ok(self.data.state.get(version_id).cloned().unwrap_or_default())
    }

    fn upsert_file(&mut self, version_id: &str, file: FileRecord) -> Result<()> {
        let file_id = file.descriptor.id.clone();
        let previous = self
            .data
            .files
            .entry(version_id.to_string())
            .or_default()
            .insert(file_id.clone(), file);
        self.record(UndoEntry::File {
            version_id: version_id.to_string(),
            file_id,
            previous,
        });
        Ok(())
    }

    fn file(&self, version_id: &str, file_id: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .data
            .files
            .get(version_id)
            .and_then(|files| files.get(file_id))
            .cloned())
    }

    fn files(&self, version_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .data
            .files
            .get(version_id)
            .map(|files| files.values().cloned().collect())
            .unwrap_or_default())
    }

    fn remove_file(&mut self, version_id: &str, file_id: &str) -> Result<()> {
        let previous = self
            .data
            .files
            .get_mut(version_id)
            .and_then(|files| files.remove(file_id));
        if previous.is_some() {
            self.record(UndoEntry::File {
                version_id: version_id.to_string(),
                file_id: file_id.to_string(),
                previous,
            });
        }
        Ok(())
    }

    fn upsert_file_descriptor(&mut self, descriptor: FileDescriptor) -> Result<()> {
        let id = descriptor.id.clone();
        let previous = self.data.file_descriptors.insert(id.clone(), descriptor);
        self.record(UndoEntry::FileDescriptor { id, previous });
        Ok(())
    }

    fn file_descriptor(&self, file_id: &str) -> Result<Option<FileDescriptor>> {
        Ok(self.data.file_descriptors.get(file_id).cloned())
    }

    fn export_blob(&self) -> Result<Vec<u8>> {
        let envelope = BlobEnvelope {
            format: BLOB_FORMAT.to_string(),
            data: &self.data,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}
