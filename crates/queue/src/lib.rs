//! gpuq-queue: the single-slot GPU service arbiter.
//!
//! See [`service_queue`] for the arbiter itself. This crate has no I/O of
//! its own — it publishes [`gpuq_core::QueueUpdate`]s over an `mpsc`
//! channel and leaves broadcasting them to subscribers to `gpuq-broker`.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod service_queue;

pub use service_queue::{ServiceQueue, SqGuard, DEFAULT_DEBOUNCE_INTERVAL};
