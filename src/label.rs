//! Labels attached to change sets.

use crate::engine::Lix;
use crate::error::{Error, Result};
use crate::model::Label;

/// Get or create the label called `name`.
pub fn create_label(lix: &mut Lix, name: &str) -> Result<Label> {
    if name.trim().is_empty() {
        return Err(Error::InvalidArgument("label name cannot be empty".to_string()));
    }
    if let Some(existing) = lix.store.label_by_name(name)? {
        return Ok(existing);
    }
    lix.transaction(|lix| {
        let label = Label {
            id: lix.next_id()?,
            name: name.to_string(),
        };
        lix.store.insert_label(label.clone())?;
        Ok(label)
    })
}

/// Attach a label, creating it on first use.
pub fn attach_label(lix: &mut Lix, change_set_id: &str, name: &str) -> Result<Label> {
    lix.transaction(|lix| {
        let label = create_label(lix, name)?;
        lix.store.attach_label(change_set_id, &label.id)?;
        Ok(label)
    })
}

pub fn labels_of(lix: &Lix, change_set_id: &str) -> Result<Vec<Label>> {
    lix.store().labels_of(change_set_id)
}

/// Change sets carrying the label `name`; empty when the label does not exist.
pub fn change_sets_with_label(lix: &Lix, name: &str) -> Result<Vec<String>> {
    match lix.store().label_by_name(name)? {
        Some(label) => lix.store().change_sets_with_label(&label.id),
        None => Ok(Vec::new()),
    }
}
