//! Error type that carries a process exit code, so `main()` can map
//! failures to `std::process::exit()` without scattering exit calls
//! through the startup path.

use std::fmt;

#[derive(Debug)]
pub struct ExitError {
    pub code: i32,
    pub message: String,
}

impl ExitError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ExitError {}

impl From<gpuq_daemon::DaemonError> for ExitError {
    fn from(err: gpuq_daemon::DaemonError) -> Self {
        ExitError::new(1, err.to_string())
    }
}

impl From<gpuq_daemon::ConfigError> for ExitError {
    fn from(err: gpuq_daemon::ConfigError) -> Self {
        ExitError::new(2, err.to_string())
    }
}
