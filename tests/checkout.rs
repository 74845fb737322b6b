mod support;

use lix::checkout::{before_after_of_file, checkout_change_set, read_file, write_file};
use lix::model::{ChangeSet, FileDescriptor};
use lix::plugin::JSON_PLUGIN_KEY;
use lix::version::{commit_version, version_state};
use lix::Lix;
use serde_json::{json, Value};

use support::{change_set, open, pointer_change, TestResult, FILE_ID};

/// cs0 {l0, l1, l2} <- cs1 {l2 modified} <- cs2 {l3, l4}
fn history(lix: &mut Lix) -> Result<(ChangeSet, ChangeSet, ChangeSet), lix::Error> {
    let l0 = pointer_change(lix, "/l0", json!("Value 0"))?;
    let l1 = pointer_change(lix, "/l1", json!("Value 1"))?;
    let l2 = pointer_change(lix, "/l2", json!("Value 2"))?;
    let cs0 = change_set(lix, &[l0, l1, l2], &[])?;

    let l2_modified = pointer_change(lix, "/l2", json!("Value 2 Modified"))?;
    let cs1 = change_set(lix, &[l2_modified], &[&cs0])?;

    let l3 = pointer_change(lix, "/l3", json!("Value 3"))?;
    let l4 = pointer_change(lix, "/l4", json!("Value 4"))?;
    let cs2 = change_set(lix, &[l3, l4], &[&cs1])?;
    Ok((cs0, cs1, cs2))
}

fn checkout_json(lix: &mut Lix, change_set: &ChangeSet) -> Result<Value, Box<dyn std::error::Error>> {
    let materialized = checkout_change_set(lix, &change_set.id)?;
    let file = materialized.file(FILE_ID).ok_or("file not materialized")?;
    Ok(serde_json::from_slice(&file.data)?)
}

#[test]
fn checkout_reconstructs_each_point_in_history() -> TestResult {
    let mut lix = open()?;
    let (cs0, cs1, cs2) = history(&mut lix)?;

    assert_eq!(
        checkout_json(&mut lix, &cs0)?,
        json!({"l0": "Value 0", "l1": "Value 1", "l2": "Value 2"})
    );
    assert_eq!(
        checkout_json(&mut lix, &cs1)?,
        json!({"l0": "Value 0", "l1": "Value 1", "l2": "Value 2 Modified"})
    );
    assert_eq!(
        checkout_json(&mut lix, &cs2)?,
        json!({
            "l0": "Value 0",
            "l1": "Value 1",
            "l2": "Value 2 Modified",
            "l3": "Value 3",
            "l4": "Value 4"
        })
    );
    Ok(())
}

#[test]
fn checkout_is_idempotent() -> TestResult {
    let mut lix = open()?;
    let (_, _, cs2) = history(&mut lix)?;

    let first = checkout_change_set(&mut lix, &cs2.id)?;
    let second = checkout_change_set(&mut lix, &cs2.id)?;
    assert_eq!(first.version.id, second.version.id);
    assert!(first.version.hidden);
    assert_eq!(first.files, second.files);
    Ok(())
}

#[test]
fn checkout_leaves_active_version_alone() -> TestResult {
    let mut lix = open()?;
    let active = lix.active_version()?;
    let (cs0, _, _) = history(&mut lix)?;

    checkout_change_set(&mut lix, &cs0.id)?;
    assert_eq!(lix.active_version()?, active);
    assert!(version_state(&lix, &active.id)?.is_empty());
    assert!(lix.store().file(&active.id, FILE_ID)?.is_none());
    Ok(())
}

#[test]
fn before_after_does_not_touch_active_file() -> TestResult {
    let mut lix = open()?;
    let (cs0, cs1, _) = history(&mut lix)?;
    let active = lix.active_version()?;

    let diff = before_after_of_file(&mut lix, Some(&cs0.id), Some(&cs1.id), FILE_ID)?;
    let before: Value = serde_json::from_slice(diff.before.as_deref().ok_or("no before")?)?;
    let after: Value = serde_json::from_slice(diff.after.as_deref().ok_or("no after")?)?;
    assert_eq!(before["l2"], json!("Value 2"));
    assert_eq!(after["l2"], json!("Value 2 Modified"));
    assert!(lix.store().file(&active.id, FILE_ID)?.is_none());

    let only_after = before_after_of_file(&mut lix, None, Some(&cs0.id), FILE_ID)?;
    assert!(only_after.before.is_none());
    assert!(only_after.after.is_some());
    Ok(())
}

#[test]
fn written_file_survives_commit_and_checkout() -> TestResult {
    let mut lix = open()?;
    let main = lix.active_version()?;
    let descriptor = FileDescriptor {
        id: "doc".to_string(),
        path: "/doc.json".to_string(),
        plugin_key: JSON_PLUGIN_KEY.to_string(),
    };

    write_file(
        &mut lix,
        &main.id,
        descriptor.clone(),
        br#"{"title": "Draft", "tags": ["a"]}"#,
    )?;
    let first = commit_version(&mut lix, &main.id, &[])?.ok_or("nothing committed")?;

    let changes = write_file(&mut lix, &main.id, descriptor, br#"{"title": "Final"}"#)?;
    assert_eq!(changes.len(), 2);
    commit_version(&mut lix, &main.id, &[])?;

    let current: Value =
        serde_json::from_slice(&read_file(&mut lix, &main.id, "doc")?.ok_or("no file")?)?;
    assert_eq!(current, json!({"title": "Final"}));

    let old = checkout_change_set(&mut lix, &first.id)?;
    let old_file = old.file("doc").ok_or("no file")?;
    assert_eq!(old_file.descriptor.path, "/doc.json");
    let old_value: Value = serde_json::from_slice(&old_file.data)?;
    assert_eq!(old_value, json!({"title": "Draft", "tags": ["a"]}));
    Ok(())
}
