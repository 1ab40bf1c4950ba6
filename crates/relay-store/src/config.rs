//! Store configuration.

use serde::{Deserialize, Serialize};

use crate::normalizer::NormalizationOptions;

/// Tunables for a [`Store`](crate::Store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Released operations kept around before their data becomes
    /// collectable.
    pub gc_release_buffer_size: usize,
    /// Record visits per cooperative GC slice.
    pub gc_slice_budget: usize,
    /// Age after which an available operation is reported stale.
    pub query_cache_expiration_ms: Option<u64>,
    /// Write `null` for selected fields missing from a payload.
    pub treat_missing_fields_as_null: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            gc_release_buffer_size: 10,
            gc_slice_budget: 256,
            query_cache_expiration_ms: None,
            treat_missing_fields_as_null: false,
        }
    }
}

impl StoreConfig {
    /// Normalization options implied by this configuration.
    pub fn normalization_options(&self) -> NormalizationOptions {
        NormalizationOptions {
            treat_missing_fields_as_null: self.treat_missing_fields_as_null,
            ..NormalizationOptions::default()
        }
    }
}
