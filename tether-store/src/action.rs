//! Typed store actions
//!
//! An action couples a resource spec with a function over that
//! resource's resolved context. Bound through a router it is callable
//! ambiently (tenant handle in, container resolved implicitly); internal
//! code that already holds a context calls it directly and skips the
//! resolution.

use crate::resource::{ResourceSpec, StoreContext};
use std::sync::Arc;

type Run<S, A, R> = Arc<dyn Fn(&StoreContext<S>, A) -> R + Send + Sync>;

/// A callable bound to a resource's state and tenant identity
pub struct Action<S, A, R> {
    spec: Arc<ResourceSpec<S>>,
    run: Run<S, A, R>,
}

impl<S, A, R> Clone for Action<S, A, R> {
    fn clone(&self) -> Self {
        Action {
            spec: self.spec.clone(),
            run: self.run.clone(),
        }
    }
}

impl<S, A, R> Action<S, A, R>
where
    S: Send + Sync + 'static,
{
    /// Define an action over `spec`'s state
    pub fn new(
        spec: Arc<ResourceSpec<S>>,
        run: impl Fn(&StoreContext<S>, A) -> R + Send + Sync + 'static,
    ) -> Self {
        Action {
            spec,
            run: Arc::new(run),
        }
    }

    /// The resource this action operates on
    pub fn spec(&self) -> &Arc<ResourceSpec<S>> {
        &self.spec
    }

    /// Run against an already-resolved context.
    ///
    /// Errors from the wrapped function propagate unchanged through `R`.
    pub fn call_in(&self, context: &StoreContext<S>, args: A) -> R {
        (self.run)(context, args)
    }
}
