//! Core error types for relay-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Every variant
//! here is a contract violation between the caller and the record model:
//! continuing past one would corrupt the graph, so they are returned as
//! errors rather than logged.

use thiserror::Error;

use crate::id::DataId;

/// Errors produced by the record model.
#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    /// Two versions of a record disagree about its id.
    #[error("invalid record update: expected id '{expected}', got '{actual}'")]
    DataIdMismatch { expected: DataId, actual: DataId },

    /// A storage key was written with a value of a different kind than the
    /// one already stored (for example a reference over a scalar).
    #[error(
        "storage key collision on record '{id}', field '{storage_key}': {existing} cannot be replaced by {incoming}"
    )]
    StorageKeyCollision {
        id: DataId,
        storage_key: String,
        existing: &'static str,
        incoming: &'static str,
    },

    /// A serialized record could not be decoded.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },
}
