//! Watchdog Channel: a write-only, fire-and-forget command link to an
//! external supervisor via a named pipe.
//!
//! Grounded in `watchdog/wd.go`: opening the FIFO happens in a detached
//! task so a reader that never shows up cannot stall the caller, and any
//! error is logged and swallowed rather than surfaced.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Clone)]
pub struct Watchdog {
    fifo_path: Arc<PathBuf>,
}

impl Watchdog {
    pub fn new(fifo_path: impl Into<PathBuf>) -> Self {
        Self { fifo_path: Arc::new(fifo_path.into()) }
    }

    /// Write `command` to the FIFO in a detached task. Never blocks the
    /// caller and never returns an error — a stuck or missing reader on
    /// the other end of the pipe is the supervisor's problem, not ours.
    pub fn send(&self, command: String) {
        let path = self.fifo_path.clone();
        tokio::spawn(async move {
            match tokio::fs::OpenOptions::new().write(true).open(path.as_path()).await {
                Ok(mut file) => match file.write_all(command.as_bytes()).await {
                    Ok(()) => tracing::info!(%command, "watchdog command sent"),
                    Err(e) => tracing::warn!(error = %e, "watchdog write failed"),
                },
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to open watchdog fifo"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_to_missing_fifo_does_not_panic() {
        let wd = Watchdog::new("/nonexistent/path/to/a/fifo");
        wd.send("restart".to_string());
        // Give the detached task a chance to run and fail quietly.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
