use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to reach backend progress endpoint: {0}")]
    ProgressFetch(String),

    #[error("malformed progress document: {0}")]
    MalformedProgress(String),

    #[error("gpu monitor line had fewer than 4 fields: {0:?}")]
    MalformedGpuLine(String),

    #[error("failed to launch gpu monitor command: {0}")]
    GpuMonitorSpawn(String),

    #[error("watchdog write failed: {0}")]
    WatchdogWrite(String),
}
