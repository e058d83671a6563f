//! Shared types for tether
//!
//! This crate provides common types used across the tether ecosystem,
//! including cache entry identifiers, synchronization tags, and live
//! event payloads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of one cache entry within a store (e.g. a document id or a
/// query fingerprint)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey(pub String);

impl EntryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fetch shape identifier
///
/// Entries with the same shape (e.g. the same projection) are combined
/// into one outbound request per batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShapeId(pub String);

impl ShapeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque synchronization tag returned by a fetch
///
/// Tags are matched against live event tags to decide whether an entry
/// needs refetching. Their contents are never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncTag(pub String);

impl SyncTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of one subscriber of one cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl SubscriberId {
    /// Allocate a fresh process-unique subscriber id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriberId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Kind of a live event received from the push feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveEventKind {
    /// Initial handshake event after the feed connects
    Welcome,
    /// Content changed on the remote
    Message,
    /// The feed reconnected and clients should assume missed events
    Restart,
}

/// Tagged change notification from the remote push feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveEvent {
    /// Event id, usable as a synchronization cursor for refetches
    pub id: String,
    /// Event kind
    pub kind: LiveEventKind,
    /// Tags of the content the event touches
    pub tags: Vec<SyncTag>,
}

impl LiveEvent {
    pub fn message(id: impl Into<String>, tags: Vec<SyncTag>) -> Self {
        Self {
            id: id.into(),
            kind: LiveEventKind::Message,
            tags,
        }
    }
}

/// Caller-supplied tenant configuration
///
/// The identifying fields determine which shared container instance a
/// caller is routed to; partition functions pick the fields they need
/// and reject configurations that lack them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    /// Project identifier, when addressing a project-scoped dataset
    pub project_id: Option<String>,
    /// Dataset name within the project
    pub dataset: Option<String>,
    /// External library identifier, for library-scoped tenants
    pub library_id: Option<String>,
    /// Optional perspective used to split sub-stores within one dataset
    pub perspective: Option<String>,
}

impl TenantConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, project_id: impl Into<String>, dataset: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self.dataset = Some(dataset.into());
        self
    }

    pub fn with_library(mut self, library_id: impl Into<String>) -> Self {
        self.library_id = Some(library_id.into());
        self
    }

    pub fn with_perspective(mut self, perspective: impl Into<String>) -> Self {
        self.perspective = Some(perspective.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriber_ids_unique() {
        let a = SubscriberId::next();
        let b = SubscriberId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tenant_config_builders() {
        let config = TenantConfig::new().with_project("p1", "production");
        assert_eq!(config.project_id.as_deref(), Some("p1"));
        assert_eq!(config.dataset.as_deref(), Some("production"));
        assert!(config.library_id.is_none());
    }
}
