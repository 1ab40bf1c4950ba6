//! Record identifiers and client id generation.
//!
//! A [`DataId`] names exactly one record in a record source. Server-provided
//! ids come straight from the payload's `id` field; everything else gets a
//! client id, either derived deterministically from its parent record and
//! storage key, or allocated from a process-wide counter.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Id of the root record that every query is read from.
pub const ROOT_ID: &str = "client:root";

/// Typename assigned to the root record.
pub const ROOT_TYPE: &str = "__Root";

/// Prefix shared by all client-generated ids.
pub const CLIENT_ID_PREFIX: &str = "client:";

const TYPE_ID_PREFIX: &str = "client:__type:";

static LOCAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a normalized record.
///
/// Wraps a `String` so record ids cannot be confused with storage keys or
/// arbitrary scalar values at the type level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataId(String);

impl DataId {
    /// Creates an id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        DataId(id.into())
    }

    /// The id of the root record.
    pub fn root() -> Self {
        DataId(ROOT_ID.to_string())
    }

    /// Returns the underlying string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when this id was generated on the client rather than by the server.
    pub fn is_client_id(&self) -> bool {
        is_client_id(&self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DataId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DataId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataId {
    fn from(id: &str) -> Self {
        DataId(id.to_string())
    }
}

impl From<String> for DataId {
    fn from(id: String) -> Self {
        DataId(id)
    }
}

impl PartialEq<str> for DataId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for DataId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// True when `id` carries the client id prefix.
pub fn is_client_id(id: &str) -> bool {
    id.starts_with(CLIENT_ID_PREFIX)
}

/// Derives a deterministic client id for an object without a server id.
///
/// The id is `client:<parent>:<storage_key>`, suffixed with `:<index>` for
/// elements of a plural field. The prefix is not repeated when the parent is
/// itself a client id.
pub fn generate_client_id(parent: &DataId, storage_key: &str, index: Option<usize>) -> DataId {
    let mut key = format!("{}:{}", parent.as_str(), storage_key);
    if let Some(index) = index {
        key.push(':');
        key.push_str(&index.to_string());
    }
    if !is_client_id(&key) {
        key.insert_str(0, CLIENT_ID_PREFIX);
    }
    DataId(key)
}

/// Allocates a fresh client id that is unique for the lifetime of the process.
pub fn generate_unique_client_id() -> DataId {
    let n = LOCAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    DataId(format!("{CLIENT_ID_PREFIX}local:{n}"))
}

/// Id of the record that stores abstract-type membership for `typename`.
pub fn generate_type_id(typename: &str) -> DataId {
    DataId(format!("{TYPE_ID_PREFIX}{typename}"))
}

/// True when `id` names a type-membership record.
pub fn is_type_id(id: &str) -> bool {
    id.starts_with(TYPE_ID_PREFIX)
}
