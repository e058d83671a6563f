//! Tether batched fetch-and-sync engine
//!
//! This crate implements the synchronization core behind tether's
//! remote-backed stores: a subscription-driven cache that fetches
//! lazily, batches aggressively, and stays fresh through the remote
//! push feed.
//!
//! # Architecture
//!
//! One engine task runs per container resolved by the tenancy router.
//! Consumers never talk to it directly; they subscribe to entry sources
//! or issue resolve-once calls, and the engine reacts to the state those
//! operations write:
//!
//! ```text
//! get_state/resolve → entry tracked → debounce window → one fetch per
//! shape → slots settle → sources notify → live events with matching
//! tags re-queue just the affected keys
//! ```
//!
//! ## Key behaviors
//!
//! - **Sharing**: identical tenant+params observe one cache entry.
//! - **Batching**: keys tracked within one debounce window become one
//!   outbound request per shape group.
//! - **Optimistic pending**: a refetched entry keeps its previous value
//!   visible until the new one lands.
//! - **Tag-scoped invalidation**: a push event refetches only entries
//!   whose recorded tags intersect the event's tags, using the event id
//!   as the synchronization cursor.
//! - **Cancellation by supersession**: when the tracked key set changes
//!   mid-fetch, the superseded batch is aborted and its results are
//!   discarded even if they arrive.
//! - **Grace-delayed reclamation**: entries whose last subscriber leaves
//!   survive a configurable grace period, so briefly remounting
//!   consumers never refetch.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_sync::{KeyParams, ResolveOptions, SyncConfig, SyncStore};
//! use tether_store::{partition, StoreRouter, TenantHandle};
//! use tether_types::TenantConfig;
//!
//! let router = StoreRouter::new(partition::by_dataset);
//! let store = SyncStore::new("documents", transport, router, SyncConfig::default());
//!
//! let tenant = TenantHandle::new(TenantConfig::new().with_project("p1", "blog"));
//! let source = store.get_state(&tenant, KeyParams::new("doc-1", "preview"))?;
//! let _sub = source.subscribe_with(|| println!("changed"));
//!
//! let value = store
//!     .resolve(&tenant, KeyParams::new("doc-2", "preview"), ResolveOptions::default())
//!     .await?;
//! ```

mod engine;
mod error;
mod state;
mod store;
mod transport;

pub use engine::{SyncConfig, SyncController};
pub use error::{SyncError, TransportError};
pub use state::{Entry, EntrySnapshot, SyncState};
pub use store::{EntrySource, KeyParams, ResolveOptions, SyncStore};
pub use transport::{BatchRequest, BatchResponse, KeyRequest, KeyResult, Transport};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::engine::SyncConfig;
    pub use crate::error::{SyncError, TransportError};
    pub use crate::state::{EntrySnapshot, SyncState};
    pub use crate::store::{KeyParams, ResolveOptions, SyncStore};
    pub use crate::transport::{BatchRequest, BatchResponse, KeyResult, Transport};
    pub use tether_store::prelude::*;
}
