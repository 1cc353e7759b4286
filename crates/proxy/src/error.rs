use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("before-dispatch hook failed: {0}")]
    Before(String),

    #[error("after-response hook failed: {0}")]
    After(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid backend target: {0}")]
    InvalidTarget(String),
}
