//! Interceptor Proxy: a reverse-proxy shim with `before`/`after` hooks
//! bound to request lifecycle.
//!
//! Grounded in `proxy/interceptor.go`'s `proxyWrapper`: there, `Before`
//! runs inside the load balancer's `Next` (i.e. before the backend is
//! dialed) and `After` runs from both `ErrorHandler` (dial/backend
//! failure, `resp == nil`) and `ModifyResponse` (success). This reproduces
//! the same two call sites around a `hyper` client request instead of
//! `echo`'s middleware chain.

use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;

/// A boxed, type-erased response body — the common currency `after` hooks
/// pass around so they can freely rewrap bodies (e.g. [`crate::BodyWrapper`])
/// without the interceptor needing to know about it.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Per-request context handed to a [`BeforeHook`]: everything it needs to
/// decide what to do, short of the actual dial.
pub struct BeforeCtx<'a> {
    pub method: &'a http::Method,
    pub path: &'a str,
    /// Caller-supplied request identity, e.g. an API key header — used by
    /// the Service Closer's predicate-based `WAIT` cut-in.
    pub identity: Option<&'a str>,
}

/// Runs synchronously before the backend is dialed. Typically consults
/// the Service Queue and installs a cleanup hook.
#[async_trait]
pub trait BeforeHook: Send + Sync {
    async fn call(&self, ctx: &BeforeCtx<'_>) -> Result<(), ProxyError>;
}

/// Runs on every response, including proxy-level failures (`resp = None`).
/// May replace the response (e.g. to wrap its body) by returning
/// `Ok(Some(new_response))`, pass it through unchanged with
/// `Ok(Some(original))`, or suppress it entirely with `Ok(None)` — this
/// last case is only meaningful after a dial failure (there is no
/// response to return).
#[async_trait]
pub trait AfterHook: Send + Sync {
    async fn call(
        &self,
        req: &http::request::Parts,
        resp: Option<http::Response<ProxyBody>>,
    ) -> Result<Option<http::Response<ProxyBody>>, ProxyError>;
}

/// The pair of optional hooks an [`InterceptorProxy`] invokes.
#[derive(Clone, Default)]
pub struct Interceptor {
    pub before: Option<Arc<dyn BeforeHook>>,
    pub after: Option<Arc<dyn AfterHook>>,
}

/// A reverse proxy to a single backend target, wired to an [`Interceptor`].
#[derive(Clone)]
pub struct InterceptorProxy {
    client: Client<HttpConnector, ProxyBody>,
    interceptor: Interceptor,
}

impl InterceptorProxy {
    pub fn new(interceptor: Interceptor) -> Self {
        Self { client: Client::builder(TokioExecutor::new()).build_http(), interceptor }
    }

    /// Proxy `req` to `target`, running `before` first and `after` last.
    /// `identity` is whatever caller-identity string the route extracted
    /// (e.g. from an API key header) for predicate-based `WAIT` cut-in.
    pub async fn proxy(
        &self,
        target: &http::Uri,
        req: http::Request<ProxyBody>,
        identity: Option<&str>,
    ) -> Result<http::Response<ProxyBody>, ProxyError> {
        let (parts, body) = req.into_parts();
        let ctx = BeforeCtx { method: &parts.method, path: parts.uri.path(), identity };
        if let Some(before) = &self.interceptor.before {
            before.call(&ctx).await.map_err(|e| ProxyError::Before(e.to_string()))?;
        }

        let outbound = rebuild_request(&parts, target, body)?;
        let dial_result = self.client.request(outbound).await;

        match dial_result {
            Ok(resp) => {
                let resp = resp.map(|b| b.boxed());
                let final_resp = self.run_after(&parts, Some(resp)).await?;
                final_resp.ok_or_else(|| ProxyError::After("after hook suppressed a successful response".to_string()))
            }
            Err(e) => {
                self.run_after(&parts, None).await?;
                Err(ProxyError::BackendUnavailable(e.to_string()))
            }
        }
    }

    async fn run_after(
        &self,
        parts: &http::request::Parts,
        resp: Option<http::Response<ProxyBody>>,
    ) -> Result<Option<http::Response<ProxyBody>>, ProxyError> {
        match &self.interceptor.after {
            Some(after) => after.call(parts, resp).await.map_err(|e| ProxyError::After(e.to_string())),
            None => Ok(resp),
        }
    }
}

fn rebuild_request(parts: &http::request::Parts, target: &http::Uri, body: ProxyBody) -> Result<http::Request<ProxyBody>, ProxyError> {
    let mut target_parts = target.clone().into_parts();
    target_parts.path_and_query = parts.uri.path_and_query().cloned();
    let uri = http::Uri::from_parts(target_parts).map_err(|e| ProxyError::InvalidTarget(e.to_string()))?;

    let mut builder = http::Request::builder().method(parts.method.clone()).uri(uri);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(body).map_err(|e| ProxyError::InvalidTarget(e.to_string()))
}
