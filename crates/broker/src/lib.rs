//! gpuq-broker: the Event Broker, its websocket handler, the Progress
//! Watcher, and the Watchdog — the three components wired together at
//! startup as collaborators of the broker's pub/sub state.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod broker;
pub mod error;
pub mod metrics;
pub mod progress_watcher;
pub mod watchdog;
pub mod ws;

pub use broker::{BrokerHandle, EventBroker, Subscription, UsersSnapshot};
pub use error::BrokerError;
pub use metrics::Metrics;
pub use progress_watcher::{BackendProgressDoc, HttpProgressSource, ProgressSource, ProgressWatcher, PwConfig};
pub use watchdog::Watchdog;
