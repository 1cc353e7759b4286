//! Progress Watcher: polls the owning backend and the GPU monitor, and
//! relays Service Queue transitions, publishing all three onto the Event
//! Broker.
//!
//! Grounded in `progress/progress.go`'s `updater()` loop, with the ETA
//! extrapolation fallback and human-readable description string it
//! computes reproduced per the design notes. The original is single-loop
//! and single-backend; this generalizes to a configurable target class and
//! three independently-scheduled loops so the GPU and service-update
//! pipelines keep running even while no backend owns the slot.

use crate::broker::BrokerHandle;
use crate::error::BrokerError;
use crate::metrics::Metrics;
use crate::watchdog::Watchdog;
use async_trait::async_trait;
use gpuq_core::{Clock, Packet, QueueUpdate, ServiceClass, Topic};
use gpuq_queue::ServiceQueue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// The backend's raw progress document, shaped after `stablediff`'s
/// `/sdapi/v1/progress` response.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendProgressDoc {
    pub progress: f64,
    #[serde(default)]
    pub eta_relative: f64,
    pub state: BackendProgressState,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BackendProgressState {
    #[serde(default)]
    pub job_count: i64,
    #[serde(default)]
    pub sampling_steps: i64,
    #[serde(default)]
    pub sampling_step: i64,
}

/// Fetches the progress document from whichever backend currently owns
/// the slot. Abstracted so tests can substitute a fixed sequence of
/// documents instead of making real HTTP calls.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    async fn fetch(&self) -> Result<BackendProgressDoc, BrokerError>;
}

/// Real implementation: a plain HTTP GET against a configured URL using
/// the same hyper client stack the daemon uses for reverse-proxying.
pub struct HttpProgressSource {
    url: http::Uri,
    client: hyper_util::client::legacy::Client<hyper_util::client::legacy::connect::HttpConnector, http_body_util::Full<bytes::Bytes>>,
}

impl HttpProgressSource {
    pub fn new(url: http::Uri) -> Self {
        let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build_http();
        Self { url, client }
    }
}

#[async_trait]
impl ProgressSource for HttpProgressSource {
    async fn fetch(&self) -> Result<BackendProgressDoc, BrokerError> {
        use http_body_util::BodyExt;

        let request = http::Request::builder()
            .uri(self.url.clone())
            .body(http_body_util::Full::new(bytes::Bytes::new()))
            .map_err(|e| BrokerError::ProgressFetch(e.to_string()))?;
        let response = tokio::time::timeout(Duration::from_secs(5), self.client.request(request))
            .await
            .map_err(|_| BrokerError::ProgressFetch("timed out".to_string()))?
            .map_err(|e| BrokerError::ProgressFetch(e.to_string()))?;
        let body = response.into_body().collect().await.map_err(|e| BrokerError::ProgressFetch(e.to_string()))?.to_bytes();
        serde_json::from_slice(&body).map_err(|e| BrokerError::MalformedProgress(e.to_string()))
    }
}

/// Published on the `progress` topic.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    pub queue: i64,
    pub progress: f64,
    pub eta: i64,
    pub description: String,
    pub last_active: u64,
}

/// Published on the `service` topic.
#[derive(Debug, Clone, Serialize)]
struct ServiceUpdate {
    service_type: String,
    wait_type: String,
    queue_depth: usize,
}

/// Configuration for the three Progress Watcher loops.
pub struct PwConfig {
    /// The service class this watcher polls progress for.
    pub target: ServiceClass,
    pub poll_interval: Duration,
    /// If an in-flight job exceeds this duration with nonzero progress,
    /// a restart command is sent through the watchdog.
    pub stuck_job_timeout: Duration,
    pub restart_command: String,
    pub gpu_poll_interval: Duration,
    pub gpu_monitor_command: Vec<String>,
}

struct ProgressState {
    last_progress: f64,
    job_started: Option<std::time::Instant>,
}

/// Handle to the three spawned loops; dropping or cancelling the token
/// stops all of them.
pub struct ProgressWatcher {
    shutdown: CancellationToken,
}

impl ProgressWatcher {
    /// Spawn the backend-progress, GPU-status, and service-update loops.
    pub fn spawn(
        cfg: PwConfig,
        sq: ServiceQueue,
        broker: BrokerHandle,
        clock: impl Clock + 'static,
        source: Arc<dyn ProgressSource>,
        watchdog: Watchdog,
        sq_updates: mpsc::Receiver<QueueUpdate>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shutdown = CancellationToken::new();

        tokio::spawn(backend_progress_loop(
            cfg.target.clone(),
            cfg.poll_interval,
            cfg.stuck_job_timeout,
            cfg.restart_command,
            sq.clone(),
            broker.clone(),
            clock.clone(),
            source,
            watchdog,
            shutdown.clone(),
        ));
        tokio::spawn(gpu_status_loop(cfg.gpu_poll_interval, cfg.gpu_monitor_command, broker.clone(), metrics.clone(), shutdown.clone()));
        tokio::spawn(service_update_loop(sq_updates, broker, clock, metrics, shutdown.clone()));

        Self { shutdown }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

fn extrapolated_eta(state: &BackendProgressState, elapsed: Duration) -> i64 {
    if state.sampling_step <= 0 {
        return 0;
    }
    let remaining = (state.sampling_steps - state.sampling_step).max(0);
    let done = state.sampling_step.max(1);
    (elapsed.as_secs_f64() * remaining as f64 / done as f64) as i64
}

async fn backend_progress_loop(
    target: ServiceClass,
    poll_interval: Duration,
    stuck_job_timeout: Duration,
    restart_command: String,
    sq: ServiceQueue,
    broker: BrokerHandle,
    clock: impl Clock,
    source: Arc<dyn ProgressSource>,
    watchdog: Watchdog,
    shutdown: CancellationToken,
) {
    let state = Mutex::new(ProgressState { last_progress: 0.0, job_started: None });
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (current, _, _) = sq.snapshot().await;
        if current != target {
            continue;
        }

        let doc = match source.fetch().await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(error = %e, "progress fetch failed");
                continue;
            }
        };

        let mut guard = state.lock().await;
        if guard.job_started.is_none() {
            guard.job_started = Some(std::time::Instant::now());
        }
        let elapsed = guard.job_started.map(|t| t.elapsed()).unwrap_or_default();

        if guard.last_progress != doc.progress {
            let eta = if doc.eta_relative > 0.0 { doc.eta_relative as i64 } else { extrapolated_eta(&doc.state, elapsed) };
            let description = format!("rendering {}/{} steps", doc.state.sampling_step, doc.state.sampling_steps);
            let update = ProgressUpdate {
                queue: doc.state.job_count,
                progress: doc.progress,
                eta,
                description,
                last_active: clock.epoch_ms(),
            };
            broker.publish(Packet::new(Topic::Progress, serde_json::json!(update))).await;
            guard.last_progress = doc.progress;
        }

        if doc.progress > 0.0 && elapsed > stuck_job_timeout {
            tracing::warn!(?elapsed, "backend job stuck, sending restart command");
            watchdog.send(restart_command.clone());
            guard.job_started = None;
        }
        if doc.progress >= 1.0 {
            guard.job_started = None;
        }
    }
}

#[derive(Debug, Clone, Serialize, Default)]
struct GpuUpdate {
    used_mb: f64,
    free_mb: f64,
    total_mb: f64,
    watts: f64,
}

fn parse_gpu_line(line: &str) -> Result<(f64, f64, f64, f64), BrokerError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < 4 {
        return Err(BrokerError::MalformedGpuLine(line.to_string()));
    }
    let parse = |s: &str| s.parse::<f64>().map_err(|_| BrokerError::MalformedGpuLine(line.to_string()));
    Ok((parse(fields[0])?, parse(fields[1])?, parse(fields[2])?, parse(fields[3])?))
}

fn aggregate_gpu_lines(output: &str) -> Result<GpuUpdate, BrokerError> {
    let mut total = GpuUpdate::default();
    let mut gpu_count = 0usize;
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let (used, free, gpu_total, watts) = parse_gpu_line(line)?;
        total.used_mb += used;
        total.free_mb += free;
        total.total_mb += gpu_total;
        total.watts += watts;
        gpu_count += 1;
    }
    if gpu_count > 1 {
        total.watts /= gpu_count as f64;
    }
    Ok(total)
}

async fn gpu_status_loop(poll_interval: Duration, command: Vec<String>, broker: BrokerHandle, metrics: Arc<Metrics>, shutdown: CancellationToken) {
    let Some((program, args)) = command.split_first() else {
        tracing::error!("gpu monitor command is empty, loop will not run");
        return;
    };
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let output = match tokio::process::Command::new(program).args(args).output().await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn gpu monitor, aborting loop");
                return;
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        match aggregate_gpu_lines(&stdout) {
            Ok(update) => {
                metrics.set_gpu(update.used_mb, update.free_mb, update.watts);
                broker.publish(Packet::new(Topic::Gpu, serde_json::json!(update))).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "malformed gpu monitor output, aborting loop");
                return;
            }
        }
    }
}

async fn service_update_loop(
    mut sq_updates: mpsc::Receiver<QueueUpdate>,
    broker: BrokerHandle,
    clock: impl Clock,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) {
    let mut last_class: Option<ServiceClass> = None;
    loop {
        let update = tokio::select! {
            _ = shutdown.cancelled() => return,
            update = sq_updates.recv() => match update {
                Some(update) => update,
                None => return,
            }
        };

        let changed = last_class.as_ref() != Some(&update.service_type);
        last_class = Some(update.service_type.clone());
        metrics.set_queue_length(update.queue_depth);

        let service = ServiceUpdate {
            service_type: update.service_type.label().to_string(),
            wait_type: update.wait_type.label().to_string(),
            queue_depth: update.queue_depth,
        };
        broker.publish(Packet::new(Topic::Service, serde_json::json!(service))).await;

        if changed {
            let description = format!("now serving {}", update.service_type.label());
            let progress = ProgressUpdate {
                queue: update.queue_depth as i64,
                progress: 0.0,
                eta: 0,
                description,
                last_active: clock.epoch_ms(),
            };
            broker.publish(Packet::new(Topic::Progress, serde_json::json!(progress))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extrapolated_eta_is_zero_with_no_progress() {
        let state = BackendProgressState { job_count: 1, sampling_steps: 20, sampling_step: 0 };
        assert_eq!(extrapolated_eta(&state, Duration::from_secs(10)), 0);
    }

    #[test]
    fn extrapolated_eta_scales_with_remaining_steps() {
        let state = BackendProgressState { job_count: 1, sampling_steps: 20, sampling_step: 10 };
        // 10s elapsed for 10 done steps => 1s/step => 10 remaining steps => 10s ETA.
        assert_eq!(extrapolated_eta(&state, Duration::from_secs(10)), 10);
    }

    #[test]
    fn gpu_line_with_too_few_fields_is_rejected() {
        assert!(parse_gpu_line("1024, 2048, 4096").is_err());
    }

    #[test]
    fn multi_gpu_lines_sum_memory_and_average_watts() {
        let output = "1000,1000,2000,100\n3000,1000,4000,300\n";
        let agg = aggregate_gpu_lines(output).unwrap();
        assert_eq!(agg.used_mb, 4000.0);
        assert_eq!(agg.free_mb, 2000.0);
        assert_eq!(agg.total_mb, 6000.0);
        assert_eq!(agg.watts, 200.0);
    }

    #[test]
    fn malformed_line_fails_aggregation() {
        let output = "1000,1000,2000,100\nnot,a,gpu,line\n";
        assert!(aggregate_gpu_lines(output).is_err());
    }
}
