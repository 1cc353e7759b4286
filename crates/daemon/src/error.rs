use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config references unknown backend {0:?}")]
    UnknownBackend(String),

    #[error(transparent)]
    InvalidBackendName(#[from] gpuq_core::CoreError),

    #[error("failed to set up metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: String, #[source] source: std::io::Error },
}
