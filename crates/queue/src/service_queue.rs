//! The single-slot service arbiter.
//!
//! `ServiceQueue` is the condition-variable-protected core from the design
//! document: at most one [`ServiceClass`] owns the slot at a time, callers
//! of the same class proceed without serialization, and a cleanup hook tied
//! to the outgoing owner runs on the next transition to a genuinely
//! different class.
//!
//! There is no native condition variable in async Rust, so this follows the
//! design notes' channel-per-waiter guidance: state lives behind a
//! [`tokio::sync::Mutex`] and wakeups are delivered through a
//! [`tokio::sync::Notify`], with the loop-and-recheck discipline a real CV
//! would need to tolerate spurious wakeups.
//!
//! The `lock`/`unlock` pair from the design is modeled as a guard,
//! [`SqGuard`], obtained from [`ServiceQueue::lock`]. Because the guard must
//! be released while waiting and re-acquired afterward, its mutating
//! methods consume and return `Self` rather than taking `&mut self` — this
//! keeps the "currently holding the lock" state a compile-time fact instead
//! of a runtime-checked `Option`.

use gpuq_core::{CleanupHook, QueueUpdate, ServiceClass};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

/// Default quiescence window for queue-depth debouncing (see the design
/// notes' discussion of the original implementation's un-awaited
/// `time.After`, which this replaces with a real delayed task).
pub const DEFAULT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);

struct Inner {
    current: ServiceClass,
    /// Meaningful only while `current == ServiceClass::Wait`.
    waited: ServiceClass,
    /// The identity (e.g. API key) of whoever currently owns `current`.
    /// Snapshotted into `waited_identity` on the transition into `Wait`, so
    /// a predicate-gated `awaitWithPredicate` can recognize a same-session
    /// follow-up during the grace period.
    owner_identity: Option<String>,
    waited_identity: Option<String>,
    hook: Option<CleanupHook>,
    wait_depth: usize,
    cleanup_cancel: Option<CancellationToken>,
    debounce_inc: Option<CancellationToken>,
    debounce_dec: Option<CancellationToken>,
}

impl Inner {
    fn new() -> Self {
        Self {
            current: ServiceClass::None,
            waited: ServiceClass::None,
            owner_identity: None,
            waited_identity: None,
            hook: None,
            wait_depth: 0,
            cleanup_cancel: None,
            debounce_inc: None,
            debounce_dec: None,
        }
    }
}

fn apply_transition(inner: &mut Inner, new: ServiceClass) {
    if matches!(new, ServiceClass::Wait) {
        inner.waited = inner.current.clone();
        inner.waited_identity = inner.owner_identity.clone();
    }
    inner.current = new;
}

/// A single-slot service arbiter shared by every request handler.
///
/// Cheap to clone: every field is an `Arc`, a `Sender`, or a `Duration`.
#[derive(Clone)]
pub struct ServiceQueue {
    state: Arc<tokio::sync::Mutex<Inner>>,
    notify: Arc<Notify>,
    cleanup_progress: Arc<CleanupProgress>,
    update_tx: mpsc::Sender<QueueUpdate>,
    debounce_interval: Duration,
}

struct CleanupProgress {
    done: tokio::sync::Mutex<bool>,
    notify: Notify,
}

impl ServiceQueue {
    /// Create a new, idle arbiter. `update_tx` is the outbound channel
    /// [`QueueUpdate`]s are published on; per the design notes this should
    /// be buffered generously so `setService` never blocks waiting for a
    /// consumer.
    pub fn new(update_tx: mpsc::Sender<QueueUpdate>) -> Self {
        Self::with_debounce_interval(update_tx, DEFAULT_DEBOUNCE_INTERVAL)
    }

    pub fn with_debounce_interval(update_tx: mpsc::Sender<QueueUpdate>, debounce_interval: Duration) -> Self {
        Self {
            state: Arc::new(tokio::sync::Mutex::new(Inner::new())),
            notify: Arc::new(Notify::new()),
            cleanup_progress: Arc::new(CleanupProgress { done: tokio::sync::Mutex::new(false), notify: Notify::new() }),
            update_tx,
            debounce_interval,
        }
    }

    /// Acquire the arbiter's mutex, returning a guard that exposes the
    /// rest of the contract. Mirrors the design's `lock`.
    pub async fn lock(&self) -> SqGuard {
        let guard = self.state.clone().lock_owned().await;
        SqGuard { sq: self.clone(), guard }
    }

    /// Block until `target` is current (or the slot is idle, or — with
    /// `allow_reent` — already `target`), without affecting the visible
    /// queue depth. Returns the still-held guard so the caller can inspect
    /// which condition was actually met before releasing it; intended for
    /// read-only gating (the Progress Watcher's "is my backend current"
    /// poll), not for acquiring ownership — use [`SqGuard::acquire`] for
    /// that.
    pub async fn wait_ready(&self, target: ServiceClass, allow_reent: bool) -> SqGuard {
        let guard = SqGuard { sq: self.clone(), guard: self.state.clone().lock_owned().await };
        guard.await_until(&target, allow_reent, false, None).await
    }

    /// A cheap snapshot of `(current, waited, wait_depth)` without holding
    /// the guard afterward.
    pub async fn snapshot(&self) -> (ServiceClass, ServiceClass, usize) {
        let inner = self.state.lock().await;
        (inner.current.clone(), inner.waited.clone(), inner.wait_depth)
    }

    async fn transition_to(&self, new: ServiceClass) {
        let update = {
            let mut inner = self.state.lock().await;
            apply_transition(&mut inner, new);
            QueueUpdate::new(inner.current.clone(), inner.waited.clone(), inner.wait_depth)
        };
        self.notify.notify_waiters();
        if self.update_tx.try_send(update).is_err() {
            tracing::warn!("queue update channel full or closed, dropping update");
        }
    }

    /// Signal that an externally reported cleanup (e.g. `POST
    /// /internal/free_complete`) has finished, unblocking any
    /// [`ServiceQueue::wait_for_cleanup`] callers.
    pub async fn set_cleanup_progress(&self, done: bool) {
        *self.cleanup_progress.done.lock().await = done;
        self.cleanup_progress.notify.notify_waiters();
    }

    /// Wait for [`ServiceQueue::set_cleanup_progress`] to report
    /// completion, or for `timeout` to elapse. Returns `true` if signalled,
    /// `false` on timeout.
    pub async fn wait_for_cleanup(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.cleanup_progress.notify.notified();
            if *self.cleanup_progress.done.lock().await {
                return true;
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep_until(deadline) => return false,
            }
        }
    }
}

/// A held lock on a [`ServiceQueue`]'s state.
///
/// Mutating operations consume `self` and return it so the borrow checker
/// enforces the same discipline the design's explicit `lock`/`unlock` pair
/// describes: you cannot read or mutate state you no longer hold.
pub struct SqGuard {
    sq: ServiceQueue,
    guard: OwnedMutexGuard<Inner>,
}

impl SqGuard {
    pub fn current(&self) -> &ServiceClass {
        &self.guard.current
    }

    pub fn waited(&self) -> &ServiceClass {
        &self.guard.waited
    }

    pub fn wait_depth(&self) -> usize {
        self.guard.wait_depth
    }

    /// The identity snapshotted when the slot last transitioned into
    /// `Wait` — `None` if no caller ever recorded one. Used by a
    /// predicate-gated `awaitWithPredicate` to recognize a same-session
    /// follow-up during the grace period.
    pub fn waited_identity(&self) -> Option<&str> {
        self.guard.waited_identity.as_deref()
    }

    /// Record which identity currently owns the slot, so a later
    /// transition into `Wait` can snapshot it into `waited_identity`.
    pub fn set_owner_identity(mut self, identity: Option<String>) -> Self {
        self.guard.owner_identity = identity;
        self
    }

    /// Release the lock. Equivalent to dropping the guard; spelled out for
    /// symmetry with `lock`.
    pub fn unlock(self) {}

    /// Install a cleanup hook for the class that currently owns the slot.
    /// Replaces any hook already installed, per the design's "installing a
    /// new hook while one exists simply replaces the pointer."
    pub fn install_hook(mut self, hook: CleanupHook) -> Self {
        self.guard.hook = Some(hook);
        self
    }

    /// Cancel any pending idle-cleanup timer without installing a new one.
    pub fn cancel_cleanup(mut self) -> Self {
        if let Some(token) = self.guard.cleanup_cancel.take() {
            token.cancel();
        }
        self
    }

    /// Arm a single-shot idle-cleanup timer. Cancels any existing one
    /// first — a pending timer is always cancelled before being replaced.
    pub fn set_cleanup(mut self, duration: Duration) -> Self {
        self = self.cancel_cleanup();
        let token = CancellationToken::new();
        self.guard.cleanup_cancel = Some(token.clone());
        let sq = self.sq.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(duration) => {
                    tracing::debug!("cleanup timer fired, transitioning to idle");
                    sq.transition_to(ServiceClass::None).await;
                }
            }
        });
        self
    }

    /// Unconditionally set the current service class, broadcasting the
    /// change to waiters and publishing a [`QueueUpdate`]. Entering `Wait`
    /// captures the outgoing concrete class into `waited` first.
    pub fn set_service(mut self, new: ServiceClass) -> Self {
        apply_transition(&mut self.guard, new);
        self.sq.notify.notify_waiters();
        let update = QueueUpdate::new(self.guard.current.clone(), self.guard.waited.clone(), self.guard.wait_depth);
        if self.sq.update_tx.try_send(update).is_err() {
            tracing::warn!("queue update channel full or closed, dropping update");
        }
        self
    }

    /// `await(target, allowReent)` from the design: wait for the slot, then
    /// transition into it and run the outgoing owner's cleanup hook if one
    /// is installed for a different class. Returns whether a transition
    /// actually happened (`false` on the reentrant fast path).
    pub async fn acquire(self, target: ServiceClass, allow_reent: bool) -> (Self, bool) {
        let this = self.await_until(&target, allow_reent, true, None).await;
        this.finish_acquire(target)
    }

    /// `awaitReent(target)`.
    pub async fn acquire_reentrant(self, target: ServiceClass) -> (Self, bool) {
        self.acquire(target, true).await
    }

    /// `awaitWithPredicate`: as [`SqGuard::acquire`], but a caller may also
    /// cut in during a `Wait` grace period if `predicate` reports the
    /// follow-up belongs to the same logical session as `waited`.
    pub async fn acquire_with_predicate(
        self,
        target: ServiceClass,
        allow_reent: bool,
        predicate: impl Fn() -> bool + Send + Sync,
    ) -> (Self, bool) {
        let this = self.await_until(&target, allow_reent, true, Some(&predicate)).await;
        this.finish_acquire(target)
    }

    fn finish_acquire(self, target: ServiceClass) -> (Self, bool) {
        if self.guard.current == target {
            // Reentrant: same class, no transition, hook never touched.
            return (self.cancel_cleanup(), false);
        }
        let mut this = self.set_service(target.clone());
        let hook_to_run = match &this.guard.hook {
            Some(h) if h.service_tag() != &target => this.guard.hook.take(),
            _ => None,
        };
        if let Some(hook) = hook_to_run {
            hook.run();
        }
        (this, true)
    }

    /// `awaitCheck`: the underlying wait primitive. Loops on the
    /// notification until the slot is idle, or (`allow_reent`) already
    /// `target`, or the predicate's `Wait`-grace escape applies. When
    /// `queue_up`, bumps the visible wait depth for the call's duration and
    /// schedules a debounced `Ignore` [`QueueUpdate`] for the direction.
    async fn await_until(
        mut self,
        target: &ServiceClass,
        allow_reent: bool,
        queue_up: bool,
        predicate: Option<&(dyn Fn() -> bool + Send + Sync)>,
    ) -> Self {
        if queue_up {
            self = self.bump_wait_depth(1);
        }
        loop {
            let exit = self.guard.current.is_none()
                || (allow_reent && &self.guard.current == target)
                || match (&self.guard.current, predicate) {
                    (ServiceClass::Wait, Some(p)) => &self.guard.waited == target && p(),
                    _ => false,
                };
            if exit {
                break;
            }
            let notified = self.sq.notify.notified();
            let SqGuard { sq, guard } = self;
            drop(guard);
            notified.await;
            let guard = sq.state.clone().lock_owned().await;
            self = SqGuard { sq, guard };
        }
        if queue_up {
            self = self.bump_wait_depth(-1);
        }
        self
    }

    fn bump_wait_depth(mut self, delta: i64) -> Self {
        let depth = (self.guard.wait_depth as i64 + delta).max(0) as usize;
        self.guard.wait_depth = depth;
        let slot = if delta > 0 { &mut self.guard.debounce_inc } else { &mut self.guard.debounce_dec };
        if let Some(prev) = slot.take() {
            prev.cancel();
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        let sq = self.sq.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(sq.debounce_interval) => {
                    let inner = sq.state.lock().await;
                    if inner.wait_depth == depth {
                        let waited = inner.waited.clone();
                        drop(inner);
                        let _ = sq.update_tx.try_send(QueueUpdate::new(ServiceClass::Ignore, waited, depth));
                    }
                }
            }
        });
        self
    }
}

#[cfg(test)]
#[path = "service_queue_tests.rs"]
mod tests;
