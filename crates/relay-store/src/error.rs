//! Error types for relay-store.
//!
//! Two families live here:
//! - [`StoreError`]: returned from store operations. Every variant is a
//!   caller or compiler contract violation and is never swallowed.
//! - [`NormalizationError`] and [`ReadError`]: shape problems in a payload
//!   or a required-field violation while reading. Normalization errors are
//!   collected next to the partial result instead of aborting the pass.

use thiserror::Error;

use relay_core::{CoreError, DataId, RequestIdentifier};

/// Errors produced by store, queue and executor operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record model invariant was violated while merging.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An operation was released more times than it was retained.
    #[error("retain underflow: '{0}' released more times than it was retained")]
    RetainUnderflow(RequestIdentifier),

    /// An optimistic update id that is neither applied nor pending.
    #[error("optimistic update {0} is not applied or pending")]
    UnknownOptimisticUpdate(u64),

    /// A follow-up payload matched no pending `@defer`/`@stream` placeholder.
    #[error("no pending placeholder for label '{label}' at path '{path}'")]
    UnknownIncrementalPayload { label: String, path: String },

    /// A mutation received an event that is invalid in its current state.
    #[error("mutation cannot {event} while {state}")]
    InvalidMutationTransition {
        state: &'static str,
        event: &'static str,
    },

    /// An updater tried to create a record that already exists.
    #[error("cannot create record '{0}': it already exists")]
    RecordAlreadyExists(DataId),

    /// A streamed item's parent record was not in the store.
    #[error("stream parent record '{0}' is missing")]
    MissingStreamParent(DataId),
}

/// A payload disagrees with the selection it is normalized against.
///
/// The offending subtree is skipped; sibling fields are still written.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NormalizationError {
    /// A scalar field returned an object (or a list containing objects).
    #[error("expected a scalar at '{path}', got an object")]
    ScalarShape { path: String },

    /// A linked field (or plural element) returned a non-object value.
    #[error("expected an object at '{path}', got {found}")]
    ExpectedObject { path: String, found: &'static str },

    /// A plural linked field returned a non-list value.
    #[error("expected a list at '{path}', got {found}")]
    ExpectedList { path: String, found: &'static str },

    /// A singular linked field returned a list.
    #[error("expected a single object at '{path}', got a list")]
    UnexpectedList { path: String },

    /// An `id` field held neither a string nor a number.
    #[error("invalid id at '{path}': {found}")]
    InvalidId { path: String, found: String },

    /// A streamed item's index was past the end of its parent list.
    #[error("stream item index {index} at '{path}' is past the end of a list of {len}")]
    StreamIndexOutOfRange { path: String, index: usize, len: usize },

    /// A type-conditional selection needed a typename the payload lacked.
    #[error("missing __typename at '{path}' for type condition '{type_condition}'")]
    MissingTypename { path: String, type_condition: String },

    /// Membership of a concrete type in an abstract type could not be
    /// decided: no discriminator in the payload and no declared possible types.
    #[error("cannot decide whether '{typename}' implements '{abstract_type}' at '{path}'")]
    AmbiguousTypeMembership {
        path: String,
        typename: String,
        abstract_type: String,
    },
}

impl NormalizationError {
    /// Response path the error refers to, rendered as `a.b.0`.
    pub fn path(&self) -> &str {
        match self {
            NormalizationError::ScalarShape { path }
            | NormalizationError::ExpectedObject { path, .. }
            | NormalizationError::ExpectedList { path, .. }
            | NormalizationError::UnexpectedList { path }
            | NormalizationError::InvalidId { path, .. }
            | NormalizationError::StreamIndexOutOfRange { path, .. }
            | NormalizationError::MissingTypename { path, .. }
            | NormalizationError::AmbiguousTypeMembership { path, .. } => path,
        }
    }
}

/// A read failed under a strict required-field policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ReadError {
    /// A `@required(action: THROW)` field was null or missing.
    #[error("relay: missing @required value at path '{field_path}' in '{owner}'")]
    RequiredFieldMissing { owner: String, field_path: String },

    /// Required-field handling depended on a type condition whose abstract
    /// membership could not be determined.
    #[error("cannot decide whether '{typename}' implements '{abstract_type}' in '{owner}'")]
    AmbiguousTypeMembership {
        owner: String,
        typename: String,
        abstract_type: String,
    },
}
