//! Prometheus metric registry for the Progress Watcher.
//!
//! Grounded in `metrics/metrics.go`'s `Metrics` struct: a small fixed set
//! of `Counter`/`Gauge` values registered once at startup and updated
//! in-line from the polling loops, exposed for scraping rather than
//! pushed anywhere. This carries over the queue-length gauge and the GPU
//! gauges; the upload-count/-size and task-completion counters have no
//! counterpart in this arbiter (there is no upload endpoint here) and are
//! dropped rather than ported.

use prometheus::{Encoder, Gauge, Registry, TextEncoder};

/// Owns the registry and the handles the polling loops update directly.
/// Cheap to hold behind an `Arc`; cloning a `Gauge` is a refcount bump.
pub struct Metrics {
    registry: Registry,
    queue_length: Gauge,
    gpu_used_memory_mb: Gauge,
    gpu_free_memory_mb: Gauge,
    gpu_power_watts: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let queue_length = Gauge::new("queue_length", "Number of tasks queued for processing")?;
        let gpu_used_memory_mb = Gauge::new("gpu_used_memory_mb", "Amount of occupied VRAM, in MiB")?;
        let gpu_free_memory_mb = Gauge::new("gpu_free_memory_mb", "Amount of free VRAM, in MiB")?;
        let gpu_power_watts = Gauge::new("gpu_power_watts", "GPU power draw, in watts")?;

        registry.register(Box::new(queue_length.clone()))?;
        registry.register(Box::new(gpu_used_memory_mb.clone()))?;
        registry.register(Box::new(gpu_free_memory_mb.clone()))?;
        registry.register(Box::new(gpu_power_watts.clone()))?;

        Ok(Self { registry, queue_length, gpu_used_memory_mb, gpu_free_memory_mb, gpu_power_watts })
    }

    pub fn set_queue_length(&self, depth: usize) {
        self.queue_length.set(depth as f64);
    }

    /// The three GPU gauge updates the Progress Watcher's GPU loop emits
    /// alongside its `gpu` broker packet.
    pub fn set_gpu(&self, used_mb: f64, free_mb: f64, watts: f64) {
        self.gpu_used_memory_mb.set(used_mb);
        self.gpu_free_memory_mb.set(free_mb);
        self.gpu_power_watts.set(watts);
    }

    /// Render the registry in Prometheus's text exposition format, for a
    /// `GET /metrics` handler to serve directly.
    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_gauges_by_name() {
        let metrics = Metrics::new().unwrap();
        metrics.set_queue_length(3);
        metrics.set_gpu(1000.0, 2000.0, 250.0);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("queue_length 3"));
        assert!(text.contains("gpu_used_memory_mb 1000"));
        assert!(text.contains("gpu_free_memory_mb 2000"));
        assert!(text.contains("gpu_power_watts 250"));
    }
}
