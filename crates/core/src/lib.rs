//! gpuq-core: shared data model for the GPU service arbitration core.
//!
//! This crate holds the types every other `gpuq-*` crate agrees on:
//! [`ServiceClass`], the broker's [`Packet`]/[`Topic`]/[`QueueUpdate`] wire
//! shapes, [`CleanupHook`], and the [`Clock`] abstraction used anywhere time
//! needs to be faked in tests.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod cleanup_hook;
pub mod clock;
pub mod error;
pub mod packet;
pub mod service_class;

pub use cleanup_hook::CleanupHook;
pub use clock::{Clock, FakeClock, SystemClock};
pub use error::CoreError;
pub use packet::{Packet, QueueUpdate, Topic};
pub use service_class::ServiceClass;
