//! Error types for lix
//!
//! Error classes:
//! - 2: User error (bad argument, unknown id, bad config or blob)
//! - 3: Rejected by graph integrity rules (cycles, duplicate elements, merge undo)
//! - 4: Operation failed (plugin, io, serialization, stale pointer)

use std::path::PathBuf;
use thiserror::Error;

/// Numeric error classes for hosting applications
pub mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const USER_ERROR: i32 = 2;
    pub const INTEGRITY_REJECTED: i32 = 3;
    pub const OPERATION_FAILED: i32 = 4;
}

/// Main error type for lix operations
#[derive(Error, Debug)]
pub enum Error {
    // User errors (class 2)
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid blob: {0}")]
    InvalidBlob(String),

    #[error("No plugin registered for key {0}")]
    PluginNotFound(String),

    // Integrity rejections (class 3)
    #[error("Graph integrity violation: {0}")]
    GraphIntegrity(String),

    #[error("Cannot undo change set {change_set_id}: it has {parents} parents")]
    UnsupportedMergeTopology { change_set_id: String, parents: usize },

    #[error(
        "Duplicate element in change set {change_set_id} for entity {entity_id} ({schema_key} in {file_id})"
    )]
    DuplicateElement {
        change_set_id: String,
        entity_id: String,
        file_id: String,
        schema_key: String,
    },

    #[error("Change already exists with different content: {0}")]
    DuplicateChange(String),

    // Operation failures (class 4)
    #[error("Version {version_id} moved: expected {expected}, found {actual}")]
    StaleVersion {
        version_id: String,
        expected: String,
        actual: String,
    },

    #[error("Plugin {plugin_key} failed: {message}")]
    Plugin { plugin_key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("Lock acquisition failed: {0}")]
    LockFailed(PathBuf),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Get the error class for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotFound { .. }
            | Error::InvalidArgument(_)
            | Error::InvalidConfig(_)
            | Error::InvalidBlob(_)
            | Error::PluginNotFound(_) => exit_codes::USER_ERROR,

            Error::GraphIntegrity(_)
            | Error::UnsupportedMergeTopology { .. }
            | Error::DuplicateElement { .. }
            | Error::DuplicateChange(_) => exit_codes::INTEGRITY_REJECTED,

            Error::StaleVersion { .. }
            | Error::Plugin { .. }
            | Error::Io(_)
            | Error::Json(_)
            | Error::TomlParse(_)
            | Error::LockFailed(_) => exit_codes::OPERATION_FAILED,
        }
    }

    /// Structured fields for errors that carry more than a message.
    pub fn details(&self) -> Option<serde_json::Value> {
        use serde_json::json;

        match self {
            Error::NotFound { kind, id } => Some(json!({ "kind": kind, "id": id })),
            Error::UnsupportedMergeTopology {
                change_set_id,
                parents,
            } => Some(json!({ "change_set_id": change_set_id, "parents": parents })),
            Error::DuplicateElement {
                change_set_id,
                entity_id,
                file_id,
                schema_key,
            } => Some(json!({
                "change_set_id": change_set_id,
                "entity_id": entity_id,
                "file_id": file_id,
                "schema_key": schema_key,
            })),
            Error::StaleVersion {
                version_id,
                expected,
                actual,
            } => Some(json!({
                "version_id": version_id,
                "expected": expected,
                "actual": actual,
            })),
            Error::Plugin {
                plugin_key,
                message,
            } => Some(json!({ "plugin_key": plugin_key, "message": message })),
            Error::InvalidArgument(message)
            | Error::InvalidConfig(message)
            | Error::InvalidBlob(message)
            | Error::GraphIntegrity(message) => Some(json!({ "message": message })),
            _ => None,
        }
    }
}

/// Result type alias for lix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wrapper for handing errors to a host in JSON form
#[derive(serde::Serialize)]
pub struct JsonError {
    pub error: String,
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl From<&Error> for JsonError {
    fn from(err: &Error) -> Self {
        JsonError {
            error: err.to_string(),
            code: err.exit_code(),
            details: err.details(),
        }
    }
}
