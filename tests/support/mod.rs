#![allow(dead_code)]

use std::sync::Once;

use lix::change::{append_change, NewChange};
use lix::config::LixConfig;
use lix::graph::{create_change_set, CreateChangeSetOptions};
use lix::leaf::{resolve_leaves, LeafSet, TraversalMode};
use lix::model::{Change, ChangeSet, EntityKey};
use lix::plugin::{JSON_PLUGIN_KEY, JSON_POINTER_SCHEMA};
use lix::version::stage_entity;
use lix::Lix;
use serde_json::{json, Value};

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

pub const FILE_ID: &str = "file0";
pub const SCHEMA: &str = "test_entity";

static TRACING: Once = Once::new();

/// Install a fmt subscriber when `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var_os("RUST_LOG").is_none() {
            return;
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn open() -> Result<Lix, lix::Error> {
    init_tracing();
    Lix::open_in_memory()
}

pub fn open_deterministic() -> Result<Lix, lix::Error> {
    init_tracing();
    let mut config = LixConfig::default();
    config.clock.deterministic = true;
    Lix::open(config)
}

/// Append a plain entity change in `FILE_ID`; `None` records a deletion.
pub fn entity_change(
    lix: &mut Lix,
    entity: &str,
    value: Option<Value>,
) -> Result<Change, lix::Error> {
    append_change(lix, NewChange::new(entity, FILE_ID, SCHEMA, value))
}

/// Append a JSON-pointer change the bundled plugin can materialize.
pub fn pointer_change(lix: &mut Lix, pointer: &str, value: Value) -> Result<Change, lix::Error> {
    append_change(
        lix,
        NewChange::new(
            pointer,
            FILE_ID,
            JSON_POINTER_SCHEMA,
            Some(json!({ "path": pointer, "value": value })),
        )
        .with_plugin(JSON_PLUGIN_KEY),
    )
}

pub fn change_set(
    lix: &mut Lix,
    changes: &[Change],
    parents: &[&ChangeSet],
) -> Result<ChangeSet, lix::Error> {
    create_change_set(
        lix,
        CreateChangeSetOptions {
            change_ids: changes.iter().map(|change| change.id.clone()).collect(),
            parents: parents.iter().map(|parent| parent.id.clone()).collect(),
            ..Default::default()
        },
    )
}

pub fn stage(
    lix: &mut Lix,
    version_id: &str,
    entity: &str,
    value: Option<Value>,
) -> Result<Change, lix::Error> {
    stage_entity(lix, version_id, NewChange::new(entity, FILE_ID, SCHEMA, value))
}

pub fn key(entity: &str) -> EntityKey {
    EntityKey::new(entity, FILE_ID, SCHEMA)
}

/// Recursive leaves reduced to key -> change id.
pub fn leaf_ids(lix: &Lix, change_set_id: &str) -> Result<Vec<(EntityKey, String)>, lix::Error> {
    Ok(leaves(lix, change_set_id)?
        .into_iter()
        .map(|(key, leaf)| (key, leaf.change.id))
        .collect())
}

pub fn leaves(lix: &Lix, change_set_id: &str) -> Result<LeafSet, lix::Error> {
    resolve_leaves(lix, change_set_id, TraversalMode::Recursive)
}
