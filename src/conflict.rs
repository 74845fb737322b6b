//! Conflict tracking.
//!
//! Conflicts are advisory records: nothing blocks on them. A conflict is
//! bound to versions through pointer rows, and branching a version copies
//! its pointers so unresolved conflicts follow the lineage.

use std::collections::BTreeSet;

use tracing::debug;

use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::model::{ChangeConflict, ConflictPointer};
use crate::version;

// =============================================================================
// Conflict keys
// =============================================================================

/// Both sides of a merge edited the same entity independently.
pub const DIVERGENT_EDIT_KEY: &str = "lix_divergent_edit";

// =============================================================================
// Operations
// =============================================================================

/// Record a conflict between `conflicting_change_ids` and bind it to `version_id`.
pub fn create_change_conflict<I, S>(
    lix: &mut Lix,
    key: &str,
    conflicting_change_ids: I,
    version_id: &str,
) -> Result<ChangeConflict>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    if key.trim().is_empty() {
        return Err(Error::InvalidArgument(
            "conflict key cannot be empty".to_string(),
        ));
    }
    let ids: BTreeSet<String> = conflicting_change_ids.into_iter().map(Into::into).collect();
    if ids.is_empty() {
        return Err(Error::InvalidArgument(
            "a conflict needs at least one change".to_string(),
        ));
    }

    lix.transaction(|lix| {
        version::get_version(lix, version_id)?;
        for id in &ids {
            if lix.store.change(id)?.is_none() {
                return Err(Error::not_found("change", id));
            }
        }

        let conflict = ChangeConflict {
            id: lix.next_id()?,
            key: key.to_string(),
            conflicting_change_ids: ids,
        };
        lix.store.insert_conflict(conflict.clone())?;
        lix.store.insert_conflict_pointer(ConflictPointer {
            change_conflict_id: conflict.id.clone(),
            version_id: version_id.to_string(),
        })?;
        debug!(
            conflict = %conflict.id,
            key,
            version = version_id,
            changes = conflict.conflicting_change_ids.len(),
            "recorded change conflict"
        );
        Ok(conflict)
    })
}

/// Conflicts currently bound to a version.
pub fn conflicts_for_version(lix: &Lix, version_id: &str) -> Result<Vec<ChangeConflict>> {
    let mut conflicts = Vec::new();
    for pointer in lix.store().conflict_pointers(version_id)? {
        let conflict = lix
            .store()
            .conflict(&pointer.change_conflict_id)?
            .ok_or_else(|| Error::not_found("change conflict", &pointer.change_conflict_id))?;
        conflicts.push(conflict);
    }
    Ok(conflicts)
}

/// Bind every conflict of `from_version_id` to `to_version_id` as well.
pub(crate) fn copy_conflict_pointers(
    lix: &mut Lix,
    from_version_id: &str,
    to_version_id: &str,
) -> Result<usize> {
    lix.transaction(|lix| {
        let pointers = lix.store.conflict_pointers(from_version_id)?;
        for pointer in &pointers {
            lix.store.insert_conflict_pointer(ConflictPointer {
                change_conflict_id: pointer.change_conflict_id.clone(),
                version_id: to_version_id.to_string(),
            })?;
        }
        Ok(pointers.len())
    })
}
