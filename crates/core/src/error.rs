use thiserror::Error;

/// Errors shared across the arbitration core's crates.
///
/// Crate-local operations mostly define their own narrower error enums (see
/// `gpuq-broker::BrokerError`, `gpuq-proxy::ProxyError`); this one covers
/// the handful of things that are genuinely cross-cutting, like config-time
/// backend name validation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid service class name: {0:?}")]
    InvalidServiceClass(String),
}
