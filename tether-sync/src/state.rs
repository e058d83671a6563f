//! Sync store state model
//!
//! One `SyncState` lives in each sync-backed container's state cell. It
//! maps entry keys to their cached slot: value, pending flag, recorded
//! sync tags, and subscriber ids. Every mutation helper returns
//! `Option<Self>` so it can feed the state cell's setter directly —
//! `None` means the mutation was a structural no-op and nobody gets
//! notified.

use crate::error::SyncError;
use crate::transport::BatchResponse;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tether_types::{EntryKey, ShapeId, SubscriberId, SyncTag};

/// One cached slot per entry key
#[derive(Debug, Clone)]
pub struct Entry<V> {
    /// Key this slot is tracked under
    pub key: EntryKey,
    /// Shape used to group this key into batch fetches
    pub shape: ShapeId,
    /// Opaque query params forwarded to the transport
    pub params: serde_json::Value,
    /// Last successfully fetched value, preserved while a refetch is
    /// pending
    pub data: Option<V>,
    /// Whether a fetch covering this key is outstanding
    pub pending: bool,
    /// Error of the most recent failed fetch, cleared by the next
    /// successful one
    pub error: Option<Arc<SyncError>>,
    /// Consumers currently observing this key
    pub subscribers: HashSet<SubscriberId>,
    /// Tags of the most recent successful fetch; replaced, never merged
    pub sync_tags: HashSet<SyncTag>,
    /// When the slot last settled from a fetch
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl<V> Entry<V> {
    fn new(key: EntryKey, shape: ShapeId, params: serde_json::Value) -> Self {
        Entry {
            key,
            shape,
            params,
            data: None,
            pending: true,
            error: None,
            subscribers: HashSet::new(),
            sync_tags: HashSet::new(),
            last_fetch_at: None,
        }
    }
}

/// Read-only view of one entry handed to consumers
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot<V> {
    /// Cached value, if any fetch has succeeded
    pub data: Option<V>,
    /// Whether a fetch covering the key is outstanding
    pub pending: bool,
    /// When the entry last settled
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl<V> EntrySnapshot<V> {
    /// Snapshot for a key that is not tracked yet: pending, no value
    pub fn untracked() -> Self {
        EntrySnapshot {
            data: None,
            pending: true,
            last_fetch_at: None,
        }
    }
}

/// State of one sync-backed container
#[derive(Debug, Clone)]
pub struct SyncState<V> {
    /// Tracked entries by key
    pub entries: HashMap<EntryKey, Entry<V>>,
    /// Container-level failure; surfaces on every read until the
    /// container is recreated
    pub fatal: Option<Arc<SyncError>>,
}

impl<V> Default for SyncState<V> {
    fn default() -> Self {
        SyncState {
            entries: HashMap::new(),
            fatal: None,
        }
    }
}

impl<V: Clone> SyncState<V> {
    /// Keys of all tracked entries, in stable order
    pub fn key_set(&self) -> BTreeSet<EntryKey> {
        self.entries.keys().cloned().collect()
    }

    /// Add a subscriber to a key, creating the entry on first interest
    pub(crate) fn added_subscriber(
        &self,
        key: &EntryKey,
        shape: &ShapeId,
        params: &serde_json::Value,
        id: SubscriberId,
    ) -> Option<Self> {
        if let Some(entry) = self.entries.get(key) {
            if entry.subscribers.contains(&id) {
                return None;
            }
        }
        let mut next = self.clone();
        let entry = next
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(key.clone(), shape.clone(), params.clone()));
        entry.subscribers.insert(id);
        Some(next)
    }

    /// Remove a subscriber from a key. The entry stays; reclaiming it is
    /// the engine's grace-delayed decision.
    pub(crate) fn removed_subscriber(&self, key: &EntryKey, id: SubscriberId) -> Option<Self> {
        let entry = self.entries.get(key)?;
        if !entry.subscribers.contains(&id) {
            return None;
        }
        let mut next = self.clone();
        if let Some(entry) = next.entries.get_mut(key) {
            entry.subscribers.remove(&id);
        }
        Some(next)
    }

    /// Track a key without registering any subscriber (resolve-once)
    pub(crate) fn added_entry(
        &self,
        key: &EntryKey,
        shape: &ShapeId,
        params: &serde_json::Value,
    ) -> Option<Self> {
        if self.entries.contains_key(key) {
            return None;
        }
        let mut next = self.clone();
        next.entries.insert(
            key.clone(),
            Entry::new(key.clone(), shape.clone(), params.clone()),
        );
        Some(next)
    }

    /// Drop tracked entries that still have no subscribers.
    ///
    /// The subscriber check runs against the state the setter sees, so a
    /// subscriber that arrived after the removal was decided keeps its
    /// entry.
    pub(crate) fn removed_idle_entries(&self, keys: &[EntryKey]) -> Option<Self> {
        let removable: Vec<&EntryKey> = keys
            .iter()
            .filter(|key| {
                matches!(self.entries.get(key), Some(entry) if entry.subscribers.is_empty())
            })
            .collect();
        if removable.is_empty() {
            return None;
        }
        let mut next = self.clone();
        for key in removable {
            next.entries.remove(key);
        }
        Some(next)
    }

    /// Mark queued keys pending, preserving any prior value as the
    /// stale-while-revalidate placeholder
    pub(crate) fn marked_pending(&self, keys: &BTreeSet<EntryKey>) -> Option<Self> {
        let needs_update = keys
            .iter()
            .any(|key| matches!(self.entries.get(key), Some(entry) if !entry.pending));
        if !needs_update {
            return None;
        }
        let mut next = self.clone();
        for key in keys {
            if let Some(entry) = next.entries.get_mut(key) {
                entry.pending = true;
            }
        }
        Some(next)
    }

    /// Apply a successful batch response.
    ///
    /// Every key in the response settles with its value and tags (tags
    /// replaced verbatim, never merged); requested keys the response
    /// skipped settle empty.
    pub(crate) fn applied(
        &self,
        requested: &[EntryKey],
        response: &BatchResponse<V>,
        at: DateTime<Utc>,
    ) -> Option<Self> {
        if !requested.iter().any(|key| self.entries.contains_key(key)) {
            return None;
        }
        let mut next = self.clone();
        let mut covered = HashSet::new();
        for result in &response.results {
            covered.insert(&result.key);
            if let Some(entry) = next.entries.get_mut(&result.key) {
                entry.data = result.value.clone();
                entry.pending = false;
                entry.error = None;
                entry.sync_tags = result.sync_tags.iter().cloned().collect();
                entry.last_fetch_at = Some(at);
            }
        }
        for key in requested {
            if covered.contains(key) {
                continue;
            }
            if let Some(entry) = next.entries.get_mut(key) {
                entry.data = None;
                entry.pending = false;
                entry.error = None;
                entry.sync_tags.clear();
                entry.last_fetch_at = Some(at);
            }
        }
        Some(next)
    }

    /// Record a failed fetch on the keys it covered; unrelated entries
    /// stay servable
    pub(crate) fn errored(&self, keys: &[EntryKey], error: Arc<SyncError>) -> Option<Self> {
        if !keys.iter().any(|key| self.entries.contains_key(key)) {
            return None;
        }
        let mut next = self.clone();
        for key in keys {
            if let Some(entry) = next.entries.get_mut(key) {
                entry.pending = false;
                entry.error = Some(error.clone());
            }
        }
        Some(next)
    }

    /// Record a container-level failure
    pub(crate) fn failed(&self, error: Arc<SyncError>) -> Option<Self> {
        if self.fatal.is_some() {
            return None;
        }
        let mut next = self.clone();
        next.fatal = Some(error);
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::KeyResult;

    fn key(name: &str) -> EntryKey {
        EntryKey::new(name)
    }

    fn shape() -> ShapeId {
        ShapeId::new("preview")
    }

    fn params() -> serde_json::Value {
        serde_json::json!({"projection": "preview"})
    }

    #[test]
    fn test_added_subscriber_is_idempotent() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();

        let state = state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .unwrap();
        assert!(state.entries[&key("a")].pending);
        assert!(state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .is_none());
    }

    #[test]
    fn test_removed_subscriber_keeps_entry() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .unwrap();

        let state = state.removed_subscriber(&key("a"), id).unwrap();
        assert!(state.entries[&key("a")].subscribers.is_empty());
        assert!(state.removed_subscriber(&key("a"), id).is_none());
        assert!(state.removed_subscriber(&key("missing"), id).is_none());
    }

    #[test]
    fn test_marked_pending_preserves_prior_value() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .unwrap();
        let response = BatchResponse {
            results: vec![KeyResult {
                key: key("a"),
                value: Some("v1".to_string()),
                sync_tags: vec![SyncTag::new("t1")],
            }],
        };
        let state = state.applied(&[key("a")], &response, Utc::now()).unwrap();
        assert!(!state.entries[&key("a")].pending);

        let queued: BTreeSet<_> = [key("a")].into_iter().collect();
        let state = state.marked_pending(&queued).unwrap();
        let entry = &state.entries[&key("a")];
        assert!(entry.pending);
        assert_eq!(entry.data.as_deref(), Some("v1"));

        // Re-marking an already pending set is a structural no-op
        assert!(state.marked_pending(&queued).is_none());
    }

    #[test]
    fn test_applied_replaces_tags_verbatim() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .unwrap();

        let first = BatchResponse {
            results: vec![KeyResult {
                key: key("a"),
                value: Some("v1".to_string()),
                sync_tags: vec![SyncTag::new("t1"), SyncTag::new("t2")],
            }],
        };
        let state = state.applied(&[key("a")], &first, Utc::now()).unwrap();

        let second = BatchResponse {
            results: vec![KeyResult {
                key: key("a"),
                value: Some("v2".to_string()),
                sync_tags: vec![SyncTag::new("t3")],
            }],
        };
        let state = state.applied(&[key("a")], &second, Utc::now()).unwrap();

        let entry = &state.entries[&key("a")];
        assert_eq!(entry.data.as_deref(), Some("v2"));
        assert_eq!(
            entry.sync_tags,
            [SyncTag::new("t3")].into_iter().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_applied_settles_missing_keys_empty() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("gone"), &shape(), &params(), id)
            .unwrap();

        let response = BatchResponse { results: vec![] };
        let state = state.applied(&[key("gone")], &response, Utc::now()).unwrap();
        let entry = &state.entries[&key("gone")];
        assert!(!entry.pending);
        assert!(entry.data.is_none());
    }

    #[test]
    fn test_errored_marks_only_covered_keys() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("a"), &shape(), &params(), id)
            .unwrap();
        let state = state
            .added_subscriber(&key("b"), &shape(), &params(), SubscriberId::next())
            .unwrap();

        let error = Arc::new(SyncError::Fetch {
            shape: shape(),
            message: "boom".into(),
        });
        let state = state.errored(&[key("a")], error).unwrap();
        assert!(state.entries[&key("a")].error.is_some());
        assert!(state.entries[&key("b")].error.is_none());
    }

    #[test]
    fn test_removed_idle_entries_keeps_subscribed_ones() {
        let state = SyncState::<String>::default();
        let id = SubscriberId::next();
        let state = state
            .added_subscriber(&key("busy"), &shape(), &params(), id)
            .unwrap();
        let state = state.added_entry(&key("idle"), &shape(), &params()).unwrap();

        let state = state
            .removed_idle_entries(&[key("busy"), key("idle")])
            .unwrap();
        assert!(state.entries.contains_key(&key("busy")));
        assert!(!state.entries.contains_key(&key("idle")));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // The tracked key set is a membership fingerprint: insertion
            // order must never affect it
            #[test]
            fn prop_key_set_is_insertion_order_insensitive(
                keys in proptest::collection::vec("[a-z]{1,6}", 0..24)
            ) {
                let forward = keys.iter().fold(SyncState::<String>::default(), |state, name| {
                    state
                        .added_entry(&EntryKey::new(name.clone()), &shape(), &params())
                        .unwrap_or(state)
                });
                let backward = keys.iter().rev().fold(SyncState::<String>::default(), |state, name| {
                    state
                        .added_entry(&EntryKey::new(name.clone()), &shape(), &params())
                        .unwrap_or(state)
                });
                prop_assert_eq!(forward.key_set(), backward.key_set());
            }
        }
    }
}
