//! gpuq-proxy: the Interceptor Proxy and Service Closer.

#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod body_wrapper;
pub mod error;
pub mod interceptor;
pub mod service_closer;
pub mod service_opener;

pub use body_wrapper::BodyWrapper;
pub use error::ProxyError;
pub use interceptor::{AfterHook, BeforeCtx, BeforeHook, Interceptor, InterceptorProxy, ProxyBody};
pub use service_closer::ServiceCloser;
pub use service_opener::ServiceOpener;
