//! Data model for the relay client store.
//!
//! Defines what the store holds and what it is asked to read or write, with
//! no store logic of its own:
//!
//! - [`id`]: `DataId` and client id generation
//! - [`value`]: `FieldValue` (scalar / reference / reference list)
//! - [`record`]: `Record`, the flat per-entity map of storage keys
//! - [`storage_key`]: arguments and canonical storage keys
//! - [`selection`]: compiled selection trees and request artifacts
//! - [`descriptor`]: selectors and operation descriptors
//! - [`payload`]: raw network response shapes
//! - [`error`]: `CoreError`

pub mod descriptor;
pub mod error;
pub mod id;
pub mod payload;
pub mod record;
pub mod selection;
pub mod storage_key;
pub mod value;

// Re-export commonly used types
pub use descriptor::{
    create_operation_descriptor, fragment_variables, NormalizationSelector, OperationDescriptor,
    RequestDescriptor, RequestIdentifier, SingularReaderSelector, Variables,
};
pub use error::CoreError;
pub use id::{DataId, ROOT_ID, ROOT_TYPE};
pub use payload::{GraphQLResponse, PathSegment, PayloadError};
pub use record::Record;
pub use selection::{
    ConcreteRequest, NormalizationOperation, ReaderFragment, RequiredAction, Selection, Selections,
};
pub use storage_key::{format_storage_key, storage_key, Argument};
pub use value::{is_leaf_value, FieldValue};
