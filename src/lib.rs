//! lix - Change-Control Engine Library
//!
//! This library tracks fine-grained mutations to structured entities (rows,
//! document blocks, JSON pointers) in a git-like change graph that can be
//! branched, merged, undone and materialized back into file bytes.
//!
//! # Core Concepts
//!
//! - **Changes**: Append-only entity mutations pointing at content-addressed snapshots
//! - **Change Sets**: Immutable DAG nodes grouping changes, linked by parent edges
//! - **Leaves**: The single visible change per entity within an ancestry scope
//! - **Versions**: Mutable branch pointers with a working area and inheritance fallback
//! - **Merge / Undo**: Source-wins merge commits and inverse patches
//! - **Checkout**: Materializing a change set into file bytes through format plugins
//!
//! # Module Organization
//!
//! - `engine`: The `Lix` handle, transactions and the active version
//! - `store`: The state store seam and the in-memory store
//! - `clock`: Deterministic or wall-clock ids and timestamps
//! - `model`: Data model shared by all components
//! - `change`: Change and snapshot log, sync batch insert
//! - `graph`: Change sets, edges and ancestry closures
//! - `leaf`: Leaf resolution
//! - `version`: Versions, staging and commits
//! - `conflict`: Conflict records and their version pointers
//! - `merge`: Merge commits and divergence detection
//! - `undo`: Undo patches
//! - `checkout`: Materialization, file reads and writes
//! - `plugin`: Format plugin interface, registry and the JSON plugin
//! - `label`: Change set labels
//! - `config`: Configuration loading from `lix.toml`
//! - `error`: Error types and result aliases
//! - `lock`: File locking and atomic writes for persisted blobs

pub mod change;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod error;
pub mod graph;
pub mod label;
pub mod leaf;
pub mod lock;
pub mod merge;
pub mod model;
pub mod plugin;
pub mod store;
pub mod undo;
pub mod version;

pub use config::LixConfig;
pub use engine::Lix;
pub use error::{Error, Result};
