//! Field handlers.
//!
//! A handle selection asks for a client-side step after normalization: the
//! normalizer emits a [`HandleFieldPayload`] and the handler named by it
//! rewrites records through a [`RecordSourceProxy`] once the payload has
//! been merged, so it sees existing store state as well as the new data.

pub mod connection;
pub mod mutation;

use std::collections::HashMap;

use crate::mutator::RecordSourceProxy;
use crate::normalizer::HandleFieldPayload;

pub use connection::ConnectionHandler;
pub use mutation::{DeleteEdgeHandler, DeleteRecordHandler, EdgeInsertHandler, InsertPosition, NodeInsertHandler};

/// A client-side field transformation.
pub trait Handler {
    fn update(&self, store: &RecordSourceProxy, payload: &HandleFieldPayload);
}

/// Looks handlers up by the name used in `@__clientField(handle: ...)`.
pub trait HandlerProvider {
    fn get(&self, handle: &str) -> Option<&dyn Handler>;
}

/// Provides the built-in connection and mutation-directive handlers, plus
/// any registered extras.
pub struct DefaultHandlerProvider {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Default for DefaultHandlerProvider {
    fn default() -> Self {
        let mut provider = DefaultHandlerProvider {
            handlers: HashMap::new(),
        };
        provider.register("connection", ConnectionHandler);
        provider.register("deleteRecord", DeleteRecordHandler);
        provider.register("deleteEdge", DeleteEdgeHandler);
        provider.register("appendEdge", EdgeInsertHandler(InsertPosition::Append));
        provider.register("prependEdge", EdgeInsertHandler(InsertPosition::Prepend));
        provider.register("appendNode", NodeInsertHandler(InsertPosition::Append));
        provider.register("prependNode", NodeInsertHandler(InsertPosition::Prepend));
        provider
    }
}

impl DefaultHandlerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the handler for `handle`.
    pub fn register(&mut self, handle: &str, handler: impl Handler + 'static) {
        self.handlers.insert(handle.to_string(), Box::new(handler));
    }
}

impl HandlerProvider for DefaultHandlerProvider {
    fn get(&self, handle: &str) -> Option<&dyn Handler> {
        self.handlers.get(handle).map(|h| h.as_ref())
    }
}

/// Runs every payload through its handler. Payloads naming an unknown
/// handler are skipped with a warning.
pub fn apply_field_payloads(
    provider: &dyn HandlerProvider,
    store: &RecordSourceProxy,
    payloads: &[HandleFieldPayload],
) {
    for payload in payloads {
        match provider.get(&payload.handle) {
            Some(handler) => handler.update(store, payload),
            None => tracing::warn!(handle = %payload.handle, "no handler registered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_provider_knows_builtin_handles() {
        let provider = DefaultHandlerProvider::new();
        for handle in [
            "connection",
            "deleteRecord",
            "deleteEdge",
            "appendEdge",
            "prependEdge",
            "appendNode",
            "prependNode",
        ] {
            assert!(provider.get(handle).is_some(), "{handle}");
        }
        assert!(provider.get("viewer").is_none());
    }
}
