//! Change and snapshot log.
//!
//! Changes are appended once and never rewritten. Snapshots are content
//! addressed, so identical payloads share one row.

use serde_json::Value;
use tracing::debug;

use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::model::{content_hash, Change, Snapshot, NO_CONTENT_SNAPSHOT_ID, OWN_ENTITY_PLUGIN_KEY};

/// An entity mutation to record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub entity_id: String,
    pub file_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub plugin_key: String,
    /// `None` records a deletion.
    pub content: Option<Value>,
}

impl NewChange {
    pub fn new(
        entity_id: impl Into<String>,
        file_id: impl Into<String>,
        schema_key: impl Into<String>,
        content: Option<Value>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            file_id: file_id.into(),
            schema_key: schema_key.into(),
            schema_version: "1.0".to_string(),
            plugin_key: OWN_ENTITY_PLUGIN_KEY.to_string(),
            content,
        }
    }

    pub fn with_plugin(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = plugin_key.into();
        self
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }
}

/// Record a change and its snapshot, drawing id and timestamp from the clock.
pub fn append_change(lix: &mut Lix, new_change: NewChange) -> Result<Change> {
    let snapshot = Snapshot::from_content(new_change.content);
    lix.transaction(|lix| {
        let change = Change {
            id: lix.next_id()?,
            entity_id: new_change.entity_id,
            file_id: new_change.file_id,
            schema_key: new_change.schema_key,
            schema_version: new_change.schema_version,
            plugin_key: new_change.plugin_key,
            snapshot_id: snapshot.id.clone(),
            created_at: lix.now()?,
        };
        lix.store.append_change(change.clone(), snapshot)?;
        Ok(change)
    })
}

/// Record a new change that points at an already stored snapshot.
pub(crate) fn append_with_snapshot(
    lix: &mut Lix,
    template: &Change,
    snapshot_id: &str,
) -> Result<Change> {
    lix.transaction(|lix| {
        let snapshot = lix
            .store
            .snapshot(snapshot_id)?
            .ok_or_else(|| Error::not_found("snapshot", snapshot_id))?;
        let change = Change {
            id: lix.next_id()?,
            snapshot_id: snapshot.id.clone(),
            created_at: lix.now()?,
            ..template.clone()
        };
        lix.store.append_change(change.clone(), snapshot)?;
        Ok(change)
    })
}

pub fn get_change(lix: &Lix, change_id: &str) -> Result<Change> {
    lix.store()
        .change(change_id)?
        .ok_or_else(|| Error::not_found("change", change_id))
}

/// Snapshot content; `None` for the no-content sentinel or an unknown id.
pub fn get_snapshot(lix: &Lix, snapshot_id: &str) -> Result<Option<Value>> {
    Ok(lix
        .store()
        .snapshot(snapshot_id)?
        .and_then(|snapshot| snapshot.content))
}

/// Content a change points at; `None` when it records a deletion.
pub fn change_content(lix: &Lix, change: &Change) -> Result<Option<Value>> {
    if change.is_deletion() {
        return Ok(None);
    }
    match lix.store().snapshot(&change.snapshot_id)? {
        Some(snapshot) => Ok(snapshot.content),
        None => Err(Error::not_found("snapshot", &change.snapshot_id)),
    }
}

/// Outcome of [`insert_change_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub inserted: Vec<String>,
    /// Changes already present with identical rows.
    pub skipped: Vec<String>,
}

/// Insert externally produced `(change, snapshot)` pairs in one transaction.
///
/// Replaying a batch is a no-op. A change id that already exists with a
/// different row fails the whole batch with `DuplicateChange`, as does a
/// snapshot whose id does not match its content.
pub fn insert_change_batch(lix: &mut Lix, batch: Vec<(Change, Snapshot)>) -> Result<BatchReport> {
    let report = lix.transaction(|lix| {
        let mut report = BatchReport::default();
        for (change, snapshot) in batch {
            verify_snapshot(&change, &snapshot)?;
            if let Some(existing) = lix.store.change(&change.id)? {
                if existing == change {
                    report.skipped.push(change.id);
                    continue;
                }
                return Err(Error::DuplicateChange(change.id));
            }
            report.inserted.push(lix.store.append_change(change, snapshot)?);
        }
        Ok(report)
    })?;
    debug!(
        inserted = report.inserted.len(),
        skipped = report.skipped.len(),
        "inserted change batch"
    );
    Ok(report)
}

fn verify_snapshot(change: &Change, snapshot: &Snapshot) -> Result<()> {
    if change.snapshot_id != snapshot.id {
        return Err(Error::InvalidArgument(format!(
            "change {} references snapshot {} but carries {}",
            change.id, change.snapshot_id, snapshot.id
        )));
    }
    match &snapshot.content {
        None if snapshot.id == NO_CONTENT_SNAPSHOT_ID => Ok(()),
        Some(content) if content_hash(content) == snapshot.id => Ok(()),
        _ => Err(Error::InvalidArgument(format!(
            "snapshot {} does not match its content",
            snapshot.id
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn append_records_snapshot_content() {
        let mut lix = Lix::open_in_memory().unwrap();
        let change = append_change(
            &mut lix,
            NewChange::new("e1", "f1", "thing", Some(json!({"name": "a"}))),
        )
        .unwrap();
        assert_eq!(
            change_content(&lix, &change).unwrap(),
            Some(json!({"name": "a"}))
        );
        assert_eq!(get_change(&lix, &change.id).unwrap(), change);
    }

    #[test]
    fn deletion_points_at_sentinel() {
        let mut lix = Lix::open_in_memory().unwrap();
        let change = append_change(&mut lix, NewChange::new("e1", "f1", "thing", None)).unwrap();
        assert!(change.is_deletion());
        assert_eq!(change_content(&lix, &change).unwrap(), None);
    }

    #[test]
    fn unknown_change_is_not_found() {
        let lix = Lix::open_in_memory().unwrap();
        assert!(matches!(
            get_change(&lix, "missing"),
            Err(Error::NotFound { kind: "change", .. })
        ));
    }
}
