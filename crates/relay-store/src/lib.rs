//! Normalized client store for GraphQL responses.
//!
//! Responses are flattened into records keyed by id ([`normalizer`]), held
//! in a copy-on-write [`RecordSource`], and read back through compiled
//! fragments ([`reader`]). The [`Store`] tracks who read what, so a write
//! re-notifies exactly the subscribers whose records changed.
//!
//! # Architecture
//!
//! - **Records**: [`source`] (record sources and the optimistic overlay
//!   view), [`normalizer`] (payload to records), [`reader`] (records to
//!   data), [`checker`] (is everything present?).
//! - **Store**: [`store`] (publish / notify / subscribe / retain / check /
//!   invalidation), [`marker`] and [`gc`] (resumable reachability
//!   collection), [`config`].
//! - **Writes**: [`mutator`] (field-level copy-on-write updater API),
//!   [`handlers`] (connections and declarative mutation directives),
//!   [`publish_queue`] (server commits rebased under optimistic updates),
//!   [`mutation`] (mutation lifecycle), [`executor`] (`@defer`/`@stream`
//!   increments).
//!
//! Everything is single-threaded: a [`Store`] is an `Rc` handle.

pub mod checker;
pub mod config;
pub mod error;
pub mod executor;
pub mod gc;
pub mod handlers;
pub mod marker;
pub mod mutation;
pub mod mutator;
pub mod normalizer;
pub mod publish_queue;
pub mod reader;
pub mod source;
pub mod store;
pub mod subscriptions;
pub mod traversal;

#[cfg(test)]
mod test_utils;

// Re-export key types for ergonomic use.
pub use config::StoreConfig;
pub use error::{NormalizationError, ReadError, StoreError};
pub use executor::OperationExecutor;
pub use gc::GcProgress;
pub use handlers::{DefaultHandlerProvider, Handler, HandlerProvider};
pub use mutation::{Mutation, MutationState};
pub use mutator::{MutationResult, RecordProxy, RecordSourceMutator, RecordSourceProxy};
pub use normalizer::{normalize, HandleFieldPayload, IncrementalPlaceholder, NormalizationOptions, NormalizeResult};
pub use publish_queue::{OptimisticUpdate, PublishQueue, UpdateId, Updater};
pub use reader::{read, Snapshot, TypeMembership};
pub use source::{OverlayView, RecordLookup, RecordSource, RecordState};
pub use store::{OperationAvailability, Store};
pub use subscriptions::{Disposable, InvalidationState};
