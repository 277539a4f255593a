//! Per-product version counter: the causal ordering primitive of the engine.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::id::ProductId;

/// Monotonic version counter keyed by product.
///
/// - `current_version` returns 0 for products never seen.
/// - `advance` stores `max(existing, version)`, so concurrent advances never
///   move a counter backwards.
/// - `next_version` atomically reserves `current + 1`, which is what ingest
///   stamps on a new update.
#[derive(Debug, Default)]
pub struct VersionManager {
    versions: Mutex<HashMap<ProductId, u64>>,
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_version(&self, product_id: &ProductId) -> u64 {
        let versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        versions.get(product_id).copied().unwrap_or(0)
    }

    /// Record that `version` has been committed for `product_id`.
    ///
    /// Returns the stored version after the call.
    pub fn advance(&self, product_id: &ProductId, version: u64) -> u64 {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = versions.entry(product_id.clone()).or_insert(0);
        *entry = (*entry).max(version);
        *entry
    }

    /// Reserve the next version for `product_id`.
    pub fn next_version(&self, product_id: &ProductId) -> u64 {
        let mut versions = self.versions.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = versions.entry(product_id.clone()).or_insert(0);
        *entry += 1;
        *entry
    }
}
