//! Store substrate for tether
//!
//! This crate provides the building blocks every data-bearing store in
//! tether is assembled from:
//!
//! - [`StateCell`]: a single mutable, versioned value with a change
//!   stream and a structural no-op guard on its setter.
//! - [`ResourceSpec`]/[`ResourceContainer`]: per-tenant keyed lifecycle
//!   around a state cell, with one-time initialization and teardown.
//! - [`Action`]: a typed callable bound to a container's state and
//!   tenant identity, usable ambiently or with a resolved context.
//! - [`SourceSpec`]/[`StateSource`]: selector-based, memoized,
//!   change-deduplicated views over a container's state.
//! - [`StoreRouter`]: maps tenant configurations to shared container
//!   instances, reference-counts tenants, and disposes instances when
//!   the last referencing tenant detaches.
//!
//! Stores compose these pieces: define a [`ResourceSpec`] whose
//! initializer starts whatever background machinery the store needs,
//! bind actions and sources through a [`StoreRouter`], and hand callers
//! tenant handles.
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_store::{partition, Action, ResourceSpec, StoreRouter, TenantHandle};
//! use tether_types::TenantConfig;
//! use std::sync::Arc;
//!
//! let spec = Arc::new(ResourceSpec::new("counter", |_| 0u32));
//! let router = StoreRouter::new(partition::by_dataset);
//! let bump = router.bind(Action::new(spec, |ctx, ()| {
//!     ctx.state().set("bump", |prev| Some(prev + 1));
//! }));
//!
//! let tenant = TenantHandle::new(TenantConfig::new().with_project("p1", "blog"));
//! bump.call(&tenant, ()).unwrap();
//! ```

mod action;
mod cell;
mod error;
mod resource;
mod router;
mod source;
mod tenant;

pub use action::Action;
pub use cell::StateCell;
pub use error::StoreError;
pub use resource::{ExtensionMap, ResourceContainer, ResourceSpec, StoreContext, Teardown};
pub use router::{partition, BoundAction, BoundSource, PartitionFn, StoreRouter};
pub use source::{
    SelectorContext, SourceChanges, SourceSpec, StateSource, SubscriptionGuard,
};
pub use tenant::TenantHandle;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::action::Action;
    pub use crate::cell::StateCell;
    pub use crate::error::StoreError;
    pub use crate::resource::{ResourceSpec, StoreContext, Teardown};
    pub use crate::router::{partition, StoreRouter};
    pub use crate::source::{SelectorContext, SourceSpec, StateSource};
    pub use crate::tenant::TenantHandle;
    pub use tether_types::TenantConfig;
}
