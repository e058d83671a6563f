//! Transport interface
//!
//! The engine is generic over a transport that can execute one
//! coalesced fetch per shape group and expose the remote push feed.
//! Query construction, authentication, and reconnection live behind
//! this boundary; the engine only ever sees keys, opaque params, and
//! tagged results.

use crate::error::TransportError;
use async_trait::async_trait;
use tether_types::{EntryKey, LiveEvent, ShapeId, SyncTag};
use tokio::sync::broadcast;

/// One key of a batch, with the opaque params its query needs
#[derive(Debug, Clone)]
pub struct KeyRequest {
    pub key: EntryKey,
    pub params: serde_json::Value,
}

/// A coalesced fetch covering every queued key of one shape
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Shape shared by all keys in this request
    pub shape: ShapeId,
    /// Keys to fetch, with their params
    pub items: Vec<KeyRequest>,
    /// Synchronization cursor: id of the live event that triggered the
    /// refetch, when there is one. Guarantees the response incorporates
    /// that event instead of racing it.
    pub cursor: Option<String>,
}

impl BatchRequest {
    /// Keys covered by this request
    pub fn keys(&self) -> impl Iterator<Item = &EntryKey> {
        self.items.iter().map(|item| &item.key)
    }
}

/// Per-key outcome of a batch fetch
#[derive(Debug, Clone)]
pub struct KeyResult<V> {
    pub key: EntryKey,
    /// The fetched value; `None` when the remote has nothing under the
    /// key
    pub value: Option<V>,
    /// Tags recorded verbatim on the entry, replacing previous ones
    pub sync_tags: Vec<SyncTag>,
}

/// Response to a [`BatchRequest`]
#[derive(Debug, Clone)]
pub struct BatchResponse<V> {
    pub results: Vec<KeyResult<V>>,
}

/// Remote API access used by the sync engine.
///
/// Implementations are handed around as `Arc<T>` behind a watch
/// channel; swapping in a fresh handle (e.g. after a token refresh)
/// takes effect at the next dispatch, because the engine re-reads the
/// channel every time it fetches.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Value type this transport materializes per key
    type Value: Clone + Send + Sync + 'static;

    /// Execute one coalesced fetch for a shape group
    async fn fetch(&self, request: BatchRequest) -> Result<BatchResponse<Self::Value>, TransportError>;

    /// Subscribe to the remote push feed
    fn events(&self) -> broadcast::Receiver<LiveEvent>;
}
