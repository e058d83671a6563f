//! Error types for the store layer

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by store reads and tenant routing
///
/// `Source` wraps store-defined errors (e.g. a failed fetch recorded on
/// one cache entry) so that selectors can surface them through the
/// ordinary read path without a separate error channel.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A partition function required a tenant field that was absent
    #[error("tenant config is missing `{field}` (required for {partition} partitioning)")]
    MissingTenantField {
        field: &'static str,
        partition: &'static str,
    },

    /// A container registry slot holds a different state type than the
    /// caller expected
    #[error("resource `{name}` is registered with a different state type")]
    StateTypeMismatch { name: &'static str },

    /// The tenant handle was disposed before the call
    #[error("tenant handle is disposed")]
    HandleDisposed,

    /// Store-level error surfaced through a selector read
    #[error("{0}")]
    Source(Arc<dyn std::error::Error + Send + Sync + 'static>),
}

impl StoreError {
    /// Wrap a shared store-defined error for surfacing on read
    pub fn from_shared(err: Arc<dyn std::error::Error + Send + Sync + 'static>) -> Self {
        StoreError::Source(err)
    }
}
