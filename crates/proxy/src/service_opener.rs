//! Service Opener: gates a generic proxy route's backend dial on the
//! Service Queue, the `before` half of the hook pair `service_closer.rs`
//! provides the `after` half of.
//!
//! Grounded in `comfyui.go`/`llm.go`'s `Before` closures: both lock the
//! queue, `await` the route's class before the request ever reaches the
//! backend, and stash a cleanup hook for later. This generalizes that
//! from a single hard-coded backend to any `(target, path_predicate)`
//! pair, and wires the predicate-gated `WAIT` cut-in (`awaitWithPredicate`)
//! using the caller's identity rather than hard-coding one backend's
//! session rule.

use crate::error::ProxyError;
use crate::interceptor::{BeforeCtx, BeforeHook};
use async_trait::async_trait;
use gpuq_core::ServiceClass;
use gpuq_queue::ServiceQueue;
use std::sync::Arc;

/// Builds a [`BeforeHook`] bound to a single service class.
pub struct ServiceOpener {
    target: ServiceClass,
    path_predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    sq: ServiceQueue,
}

impl ServiceOpener {
    pub fn new(target: ServiceClass, path_predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>, sq: ServiceQueue) -> Self {
        Self { target, path_predicate, sq }
    }
}

#[async_trait]
impl BeforeHook for ServiceOpener {
    async fn call(&self, ctx: &BeforeCtx<'_>) -> Result<(), ProxyError> {
        if !(self.path_predicate)(ctx.path) {
            return Ok(());
        }

        let guard = self.sq.lock().await;
        let incoming_identity = ctx.identity.map(str::to_string);
        let waited_identity = guard.waited_identity().map(str::to_string);
        // Same-session cut-in during a WAIT grace period: a follow-up
        // request carrying the identity that was waited on does not have
        // to sit out the rest of the grace window.
        let predicate = move || incoming_identity.is_some() && incoming_identity == waited_identity;

        let (guard, _) = guard.acquire_with_predicate(self.target.clone(), true, predicate).await;
        let guard = guard.set_owner_identity(ctx.identity.map(str::to_string));
        guard.unlock();
        Ok(())
    }
}
