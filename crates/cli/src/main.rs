//! `gpuqd`: the service arbitration daemon's entry point.
//!
//! Parses `--config`/`--listen`, builds the daemon's process state, and
//! runs the accept loop until SIGINT requests a graceful shutdown.

mod exit_error;

use clap::Parser;
use exit_error::ExitError;
use gpuq_daemon::{app, logging, GpuqConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Single-tenant GPU service arbiter and reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "gpuqd", version)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Override the `listen` address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

async fn run(args: Args) -> Result<(), ExitError> {
    logging::init();

    let mut config = GpuqConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let (state, progress_watcher) = app::build(config).await?;
    let state = Arc::new(state);

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("received interrupt, shutting down");
            signal_shutdown.cancel();
        }
    });

    let result = app::serve(state, shutdown).await;
    progress_watcher.stop();
    result.map_err(ExitError::from)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("gpuqd: {err}");
            ExitCode::from(err.code as u8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_override_is_optional() {
        let args = Args::parse_from(["gpuqd", "--config", "gpuqd.toml"]);
        assert_eq!(args.config, PathBuf::from("gpuqd.toml"));
        assert_eq!(args.listen, None);
    }

    #[test]
    fn listen_override_is_parsed() {
        let args = Args::parse_from(["gpuqd", "--config", "gpuqd.toml", "--listen", "0.0.0.0:9001"]);
        assert_eq!(args.listen.as_deref(), Some("0.0.0.0:9001"));
    }
}
