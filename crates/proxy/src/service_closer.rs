//! Service Closer: ties backend-stream completion to Service Queue state
//! transitions.
//!
//! Implements the five-step protocol from the design notes around
//! `servicequeue/bodywrapper.go`'s close hook, generalized from a single
//! hard-coded backend to any `(target, path_predicate, cleanup_timeout,
//! close_on_body, post_body_wait)` tuple.

use crate::body_wrapper::BodyWrapper;
use crate::error::ProxyError;
use crate::interceptor::{AfterHook, ProxyBody};
use async_trait::async_trait;
use gpuq_core::ServiceClass;
use gpuq_queue::ServiceQueue;
use http_body_util::BodyExt;
use std::sync::Arc;
use std::time::Duration;

/// Builds an [`AfterHook`] bound to a single service class.
pub struct ServiceCloser {
    target: ServiceClass,
    path_predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    cleanup_timeout: Duration,
    close_on_body: bool,
    post_body_wait: Duration,
    sq: ServiceQueue,
}

impl ServiceCloser {
    pub fn new(
        target: ServiceClass,
        path_predicate: Arc<dyn Fn(&str) -> bool + Send + Sync>,
        cleanup_timeout: Duration,
        close_on_body: bool,
        post_body_wait: Duration,
        sq: ServiceQueue,
    ) -> Self {
        Self { target, path_predicate, cleanup_timeout, close_on_body, post_body_wait, sq }
    }
}

#[async_trait]
impl AfterHook for ServiceCloser {
    async fn call(
        &self,
        req: &http::request::Parts,
        resp: Option<http::Response<ProxyBody>>,
    ) -> Result<Option<http::Response<ProxyBody>>, ProxyError> {
        // Step 1: only applies to matching routes.
        if !(self.path_predicate)(req.uri.path()) {
            return Ok(resp);
        }

        // Step 2: this response is from our own backend, so it should
        // already be current; this mainly re-asserts the hook wiring.
        let guard = self.sq.lock().await;
        let (guard, _) = guard.acquire_reentrant(self.target.clone()).await;
        guard.unlock();

        // Step 4: upstream failure path — unconditionally revert to idle.
        let Some(resp) = resp else {
            let guard = self.sq.lock().await;
            guard.set_service(ServiceClass::None).unlock();
            return Ok(None);
        };

        // Step 3: wrap the body so completion (or early disconnect) drives
        // the post-response transition.
        let resp = if self.close_on_body {
            let sq = self.sq.clone();
            let post_body_wait = self.post_body_wait;
            let (parts, body) = resp.into_parts();
            let wrapped = BodyWrapper::new(body, move || {
                tokio::spawn(async move {
                    let guard = sq.lock().await;
                    let guard = guard.cancel_cleanup();
                    if post_body_wait > Duration::ZERO {
                        let guard = guard.set_service(ServiceClass::Wait);
                        let guard = guard.set_cleanup(post_body_wait);
                        guard.unlock();
                    } else {
                        guard.set_service(ServiceClass::None).unlock();
                    }
                });
            });
            http::Response::from_parts(parts, wrapped.boxed())
        } else {
            resp
        };

        // Step 5: belt-and-suspenders idle guard in case the body is
        // never fully read and the wrapper's close hook never fires from
        // end-of-stream (the `Drop` path still catches that case).
        let guard = self.sq.lock().await;
        guard.set_cleanup(self.cleanup_timeout).unlock();

        Ok(Some(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http_body_util::Full;
    use tokio::sync::mpsc;

    fn any_path(_: &str) -> bool {
        true
    }

    #[tokio::test]
    async fn nil_response_reverts_to_idle_unconditionally() {
        let (tx, _rx) = mpsc::channel(8);
        let sq = ServiceQueue::new(tx);
        let guard = sq.lock().await;
        let (guard, _) = guard.acquire(ServiceClass::backend("llm"), true).await;
        guard.unlock();

        let closer = ServiceCloser::new(
            ServiceClass::backend("llm"),
            Arc::new(any_path),
            Duration::from_secs(30),
            true,
            Duration::ZERO,
            sq.clone(),
        );
        let req = http::Request::builder().uri("/llm/generate").body(()).unwrap();
        let (parts, _) = req.into_parts();
        let result = closer.call(&parts, None).await.unwrap();
        assert!(result.is_none());

        let (current, _, _) = sq.snapshot().await;
        assert_eq!(current, ServiceClass::None);
    }

    #[tokio::test]
    async fn body_close_without_grace_reverts_to_idle() {
        let (tx, _rx) = mpsc::channel(8);
        let sq = ServiceQueue::new(tx);
        let guard = sq.lock().await;
        let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
        guard.unlock();

        let closer =
            ServiceCloser::new(ServiceClass::backend("sd"), Arc::new(any_path), Duration::from_secs(30), true, Duration::ZERO, sq.clone());
        let req = http::Request::builder().uri("/sd/txt2img").body(()).unwrap();
        let (parts, _) = req.into_parts();
        let resp = http::Response::new(Full::new(Bytes::from_static(b"ok")).map_err(|never| match never {}).boxed());
        let result = closer.call(&parts, Some(resp)).await.unwrap().unwrap();

        // Drain the body to trigger the close hook.
        let _ = result.into_body().collect().await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let (current, _, _) = sq.snapshot().await;
        assert_eq!(current, ServiceClass::None);
    }

    #[tokio::test]
    async fn body_close_with_grace_enters_wait() {
        let (tx, _rx) = mpsc::channel(8);
        let sq = ServiceQueue::new(tx);
        let guard = sq.lock().await;
        let (guard, _) = guard.acquire(ServiceClass::backend("llm"), true).await;
        guard.unlock();

        let closer = ServiceCloser::new(
            ServiceClass::backend("llm"),
            Arc::new(any_path),
            Duration::from_secs(30),
            true,
            Duration::from_secs(3),
            sq.clone(),
        );
        let req = http::Request::builder().uri("/llm/chat").body(()).unwrap();
        let (parts, _) = req.into_parts();
        let resp = http::Response::new(Full::new(Bytes::from_static(b"ok")).map_err(|never| match never {}).boxed());
        let result = closer.call(&parts, Some(resp)).await.unwrap().unwrap();

        let _ = result.into_body().collect().await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let (current, waited, _) = sq.snapshot().await;
        assert_eq!(current, ServiceClass::Wait);
        assert_eq!(waited, ServiceClass::backend("llm"));
    }
}
