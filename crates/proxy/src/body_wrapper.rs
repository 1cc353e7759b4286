//! Response body wrapper that runs a one-shot hook when the stream ends.
//!
//! Grounded in `servicequeue/bodywrapper.go`, which wraps `io.ReadCloser`
//! and runs `onClose` from `Close`. Hyper's streaming bodies have no
//! `Close` method; the equivalent signal is "no more frames", so the hook
//! runs either when `poll_frame` first returns `None` or when the wrapper
//! is dropped before reaching the end (covers a client that disconnects
//! mid-stream) — whichever happens first, and never both.

use bytes::Bytes;
use http_body::{Body, Frame};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

type OnClose = Box<dyn FnOnce() + Send>;

pub struct BodyWrapper<B> {
    inner: B,
    on_close: Option<OnClose>,
    fired: Arc<AtomicBool>,
}

impl<B> BodyWrapper<B> {
    pub fn new(inner: B, on_close: impl FnOnce() + Send + 'static) -> Self {
        Self { inner, on_close: Some(Box::new(on_close)), fired: Arc::new(AtomicBool::new(false)) }
    }

    fn fire(&mut self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            if let Some(hook) = self.on_close.take() {
                hook();
            }
        }
    }
}

impl<B> Body for BodyWrapper<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let poll = Pin::new(&mut self.inner).poll_frame(cx);
        if let Poll::Ready(None) = poll {
            self.fire();
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }
}

impl<B> Drop for BodyWrapper<B> {
    fn drop(&mut self) {
        self.fire();
    }
}
