//! Tracing setup, matching the daemon workspace's `tracing` +
//! `tracing-subscriber` (env-filter) stack.

pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
