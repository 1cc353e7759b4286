//! Process assembly: wires the Service Queue, Event Broker, Progress
//! Watcher, Watchdog, and per-backend Interceptor Proxies together behind
//! one HTTP server, and implements the routing table from the external
//! interfaces (`/{svc}/join`, `/{svc}/leave`, `/internal/free_complete`,
//! `/q/ws`, and the generic `/*` proxy passthrough).

use crate::config::GpuqConfig;
use crate::error::DaemonError;
use bytes::Bytes;
use gpuq_broker::{BrokerHandle, EventBroker, HttpProgressSource, Metrics, ProgressWatcher, PwConfig, Watchdog};
use gpuq_core::{CleanupHook, ServiceClass, SystemClock};
use gpuq_proxy::interceptor::ProxyBody;
use gpuq_proxy::{Interceptor, InterceptorProxy, ServiceCloser, ServiceOpener};
use gpuq_queue::ServiceQueue;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

struct BackendRoute {
    class: ServiceClass,
    proxy: InterceptorProxy,
    target: http::Uri,
    join_cleanup: Duration,
    leave_cleanup: Duration,
    unload_path: Option<String>,
}

pub struct AppState {
    config: Arc<GpuqConfig>,
    sq: ServiceQueue,
    broker: BrokerHandle,
    routes: IndexMap<String, BackendRoute>,
    metrics: Arc<Metrics>,
}

fn install_join_hook(base_url: &str, unload_path: &Option<String>, class: ServiceClass) -> CleanupHook {
    let unload_url = unload_path.as_ref().map(|p| format!("{base_url}{p}"));
    CleanupHook::new(class, move || {
        let Some(url) = unload_url else { return };
        tokio::spawn(async move {
            let client = hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build_http::<Empty<Bytes>>();
            let req = match http::Request::post(&url).body(Empty::new()) {
                Ok(req) => req,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to build unload request");
                    return;
                }
            };
            if let Err(e) = client.request(req).await {
                tracing::warn!(%url, error = %e, "unload request failed");
            }
        });
    })
}

pub async fn build(config: GpuqConfig) -> Result<(AppState, ProgressWatcher), DaemonError> {
    let config = Arc::new(config);
    let (update_tx, update_rx) = tokio::sync::mpsc::channel(1024);
    let sq = ServiceQueue::with_debounce_interval(update_tx, config.debounce_interval());
    let broker = EventBroker::spawn();

    let mut routes = IndexMap::new();
    for (name, backend) in &config.backends {
        let class = ServiceClass::backend(name.as_str());
        let target: http::Uri = backend.base_url.parse().map_err(|_| DaemonError::Config(crate::error::ConfigError::UnknownBackend(name.clone())))?;
        let path_predicate: Arc<dyn Fn(&str) -> bool + Send + Sync> = Arc::new({
            let prefix = format!("/{name}/");
            move |path: &str| path.starts_with(&prefix)
        });
        let opener = ServiceOpener::new(class.clone(), path_predicate.clone(), sq.clone());
        let closer = ServiceCloser::new(
            class.clone(),
            path_predicate,
            backend.response_cleanup_timeout(),
            backend.close_on_body,
            backend.post_body_wait(),
            sq.clone(),
        );
        let interceptor = Interceptor { before: Some(Arc::new(opener)), after: Some(Arc::new(closer)) };
        routes.insert(
            name.clone(),
            BackendRoute {
                class,
                proxy: InterceptorProxy::new(interceptor),
                target,
                join_cleanup: backend.join_cleanup(),
                leave_cleanup: backend.leave_cleanup(),
                unload_path: backend.unload_path.clone(),
            },
        );
    }

    let progress_target = ServiceClass::backend(config.progress.target.as_str());
    let pw_cfg = PwConfig {
        target: progress_target,
        poll_interval: Duration::from_secs(config.progress.poll_interval_secs),
        stuck_job_timeout: Duration::from_secs(config.progress.stuck_job_timeout_secs),
        restart_command: config.progress.restart_command.clone(),
        gpu_poll_interval: Duration::from_secs(config.gpu_monitor.poll_interval_secs),
        gpu_monitor_command: config.gpu_monitor.command.clone(),
    };
    let source = Arc::new(HttpProgressSource::new(config.progress.url.parse().map_err(|_| {
        DaemonError::Config(crate::error::ConfigError::UnknownBackend(config.progress.url.clone()))
    })?));
    let watchdog = Watchdog::new(config.watchdog_fifo_path.clone());
    let metrics = Arc::new(Metrics::new().map_err(crate::error::ConfigError::Metrics)?);
    let pw = ProgressWatcher::spawn(pw_cfg, sq.clone(), broker.clone(), SystemClock, source, watchdog, update_rx, metrics.clone());

    Ok((AppState { config, sq, broker, routes, metrics }, pw))
}

async fn handle_join(state: Arc<AppState>, svc: &str) -> http::Response<ProxyBody> {
    let Some(route) = state.routes.get(svc) else { return not_found() };
    let guard = state.sq.lock().await;
    let (guard, _) = guard.acquire_reentrant(route.class.clone()).await;
    let guard = guard.install_hook(install_join_hook(&base_url_of(route), &route.unload_path, route.class.clone()));
    let guard = guard.set_cleanup(route.join_cleanup);
    guard.unlock();
    empty_response(http::StatusCode::OK)
}

fn base_url_of(route: &BackendRoute) -> String {
    route.target.to_string().trim_end_matches('/').to_string()
}

async fn handle_leave(state: Arc<AppState>, svc: &str) -> http::Response<ProxyBody> {
    let Some(route) = state.routes.get(svc) else { return not_found() };
    let guard = state.sq.lock().await;
    let (guard, _) = guard.acquire_reentrant(route.class.clone()).await;
    let guard = guard.set_cleanup(route.leave_cleanup);
    guard.unlock();
    empty_response(http::StatusCode::OK)
}

async fn handle_free_complete(state: Arc<AppState>) -> http::Response<ProxyBody> {
    state.sq.set_cleanup_progress(true).await;
    empty_response(http::StatusCode::OK)
}

async fn handle_metrics(state: Arc<AppState>) -> http::Response<ProxyBody> {
    match state.metrics.encode() {
        Ok(body) => http::Response::new(Full::new(Bytes::from(body)).map_err(|never: std::convert::Infallible| match never {}).boxed()),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode metrics");
            empty_response(http::StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn handle_proxy(state: Arc<AppState>, svc: &str, req: http::Request<Incoming>, identity: Option<String>) -> http::Response<ProxyBody> {
    let Some(route) = state.routes.get(svc) else { return not_found() };
    let (parts, body) = req.into_parts();
    let req = http::Request::from_parts(parts, body.map_err(hyper::Error::from).boxed());
    match route.proxy.proxy(&route.target, req, identity.as_deref()).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(%svc, error = %e, "proxy request failed");
            let mut resp = empty_response(http::StatusCode::BAD_GATEWAY);
            *resp.status_mut() = http::StatusCode::BAD_GATEWAY;
            resp
        }
    }
}

fn not_found() -> http::Response<ProxyBody> {
    empty_response(http::StatusCode::NOT_FOUND)
}

fn empty_response(status: http::StatusCode) -> http::Response<ProxyBody> {
    let mut resp = http::Response::new(Full::new(Bytes::new()).map_err(|never: std::convert::Infallible| match never {}).boxed());
    *resp.status_mut() = status;
    resp
}

fn first_segment(path: &str) -> Option<&str> {
    path.trim_start_matches('/').split('/').next().filter(|s| !s.is_empty())
}

pub async fn route(req: http::Request<Incoming>, state: Arc<AppState>, client_ip: String) -> http::Response<ProxyBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let identity = req.headers().get("x-gpuq-identity").and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    if method == http::Method::GET && path == "/q/ws" {
        match gpuq_broker::ws::handle(req, state.broker.clone(), client_ip) {
            Ok(resp) => return resp.map(|b| b.map_err(|never: std::convert::Infallible| match never {}).boxed()),
            Err(e) => {
                tracing::warn!(error = %e, "websocket handshake failed");
                return empty_response(http::StatusCode::BAD_REQUEST);
            }
        }
    }

    if method == http::Method::POST && path == "/internal/free_complete" {
        return handle_free_complete(state).await;
    }

    if method == http::Method::GET && path == "/metrics" {
        return handle_metrics(state).await;
    }

    if let Some(svc) = first_segment(&path) {
        if method == http::Method::POST && path == format!("/{svc}/join") {
            return handle_join(state, svc).await;
        }
        if method == http::Method::POST && path == format!("/{svc}/leave") {
            return handle_leave(state, svc).await;
        }
        if state.routes.contains_key(svc) {
            return handle_proxy(state, svc, req, identity).await;
        }
    }

    not_found()
}

/// Accept loop: binds `config.listen` and serves every connection with
/// the routing table above, the same spawn-per-connection shape the
/// daemon workspace's `Listener` uses for its Unix/TCP dual accept loop.
pub async fn serve(state: Arc<AppState>, shutdown: CancellationToken) -> Result<(), DaemonError> {
    let addr = state.config.listen.clone();
    let listener = TcpListener::bind(&addr).await.map_err(|source| DaemonError::Bind { addr: addr.clone(), source })?;
    tracing::info!(%addr, "gpuqd listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested, accept loop exiting");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "accept error");
                        continue;
                    }
                };
                let state = state.clone();
                let client_ip = peer.ip().to_string();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = hyper::service::service_fn(move |req| {
                        let state = state.clone();
                        let client_ip = client_ip.clone();
                        async move { Ok::<_, std::convert::Infallible>(route(req, state, client_ip).await) }
                    });
                    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new()).serve_connection_with_upgrades(io, service).await {
                        tracing::debug!(error = %e, "connection closed with error");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_segment_extracts_leading_path_component() {
        assert_eq!(first_segment("/sd/txt2img"), Some("sd"));
        assert_eq!(first_segment("/llm/chat/completions"), Some("llm"));
        assert_eq!(first_segment("/"), None);
        assert_eq!(first_segment(""), None);
    }

    #[tokio::test]
    async fn build_wires_one_route_per_configured_backend() {
        let config = GpuqConfig::from_toml_str(
            r#"
            [backends.sd]
            base_url = "http://127.0.0.1:1"

            [progress]
            target = "sd"
            url = "http://127.0.0.1:1/progress"

            [gpu_monitor]
            command = ["true"]
            "#,
        )
        .unwrap();
        let (state, pw) = build(config).await.unwrap();
        assert_eq!(state.routes.len(), 1);
        assert!(state.routes.contains_key("sd"));
        pw.stop();
    }
}
