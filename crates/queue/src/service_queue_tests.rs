use super::*;
use gpuq_core::ServiceClass;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn new_sq() -> (ServiceQueue, mpsc::Receiver<QueueUpdate>) {
    let (tx, rx) = mpsc::channel(64);
    (ServiceQueue::with_debounce_interval(tx, Duration::from_millis(100)), rx)
}

#[tokio::test]
async fn idle_queue_acquires_immediately() {
    let (sq, _rx) = new_sq();
    let guard = sq.lock().await;
    let (guard, transitioned) = guard.acquire(ServiceClass::backend("sd"), true).await;
    assert!(transitioned);
    assert_eq!(guard.current(), &ServiceClass::backend("sd"));
}

#[tokio::test]
async fn reentrant_acquire_does_not_transition_or_touch_hook() {
    let (sq, _rx) = new_sq();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();

    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    let guard = guard.install_hook(gpuq_core::CleanupHook::new(ServiceClass::backend("sd"), move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    }));
    guard.unlock();

    let guard = sq.lock().await;
    let (guard, transitioned) = guard.acquire_reentrant(ServiceClass::backend("sd")).await;
    assert!(!transitioned);
    assert_eq!(calls.load(Ordering::SeqCst), 0, "hook must not run for a reentrant acquire");
    guard.unlock();
}

#[tokio::test]
async fn hook_fires_exactly_once_on_class_change() {
    let (sq, _rx) = new_sq();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();

    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    let guard = guard.install_hook(gpuq_core::CleanupHook::new(ServiceClass::backend("sd"), move || {
        calls2.fetch_add(1, Ordering::SeqCst);
    }));
    guard.unlock();

    // Reentering "sd" again should not fire the hook.
    let guard = sq.lock().await;
    let (guard, _) = guard.acquire_reentrant(ServiceClass::backend("sd")).await;
    guard.unlock();
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Switching to a different backend must fire it, exactly once.
    let guard = sq.lock().await;
    let (guard, transitioned) = guard.acquire(ServiceClass::backend("llm"), true).await;
    assert!(transitioned);
    guard.unlock();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // A second switch must not refire the already-consumed hook.
    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("tts"), true).await;
    guard.unlock();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn second_caller_blocks_until_slot_released() {
    let (sq, _rx) = new_sq();

    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    guard.unlock();

    let sq2 = sq.clone();
    let waiter = tokio::spawn(async move {
        let guard = sq2.lock().await;
        let (guard, transitioned) = guard.acquire(ServiceClass::backend("llm"), true).await;
        guard.unlock();
        transitioned
    });

    // Give the waiter a chance to block on the current "sd" owner.
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    let guard = sq.lock().await;
    let guard = guard.set_service(ServiceClass::None);
    guard.unlock();

    let transitioned = waiter.await.unwrap();
    assert!(transitioned);
}

#[tokio::test(start_paused = true)]
async fn cleanup_timer_reverts_to_idle_after_duration() {
    let (sq, _rx) = new_sq();
    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    let guard = guard.set_cleanup(Duration::from_secs(5));
    guard.unlock();

    let (current, _, _) = sq.snapshot().await;
    assert_eq!(current, ServiceClass::backend("sd"));

    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;

    let (current, _, _) = sq.snapshot().await;
    assert_eq!(current, ServiceClass::None);
}

#[tokio::test(start_paused = true)]
async fn cancelling_cleanup_prevents_idle_revert() {
    let (sq, _rx) = new_sq();
    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    let guard = guard.set_cleanup(Duration::from_secs(5));
    let guard = guard.cancel_cleanup();
    guard.unlock();

    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;

    let (current, _, _) = sq.snapshot().await;
    assert_eq!(current, ServiceClass::backend("sd"));
}

#[tokio::test(start_paused = true)]
async fn queue_depth_debounces_to_a_single_ignore_update() {
    let (sq, mut rx) = new_sq();

    let guard = sq.lock().await;
    let (guard, _) = guard.acquire(ServiceClass::backend("sd"), true).await;
    guard.unlock();

    // Three rapid-fire waiters arriving inside the debounce window, each
    // blocked behind "sd", must coalesce to a single Ignore update rather
    // than one per arrival.
    for _ in 0..3 {
        let sq2 = sq.clone();
        tokio::spawn(async move {
            let guard = sq2.lock().await;
            let _ = guard.acquire(ServiceClass::backend("llm"), true).await;
        });
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_millis(10)).await;
    }

    tokio::time::advance(Duration::from_millis(200)).await;
    tokio::task::yield_now().await;

    let mut ignore_updates = 0;
    let mut last_depth = 0;
    while let Ok(update) = rx.try_recv() {
        if update.service_type == ServiceClass::Ignore {
            ignore_updates += 1;
            last_depth = update.queue_depth;
        }
    }
    assert_eq!(ignore_updates, 1, "expected exactly one coalesced Ignore update");
    assert_eq!(last_depth, 3);
}

#[tokio::test]
async fn wait_for_cleanup_observes_progress_set_before_wait_started() {
    let (sq, _rx) = new_sq();
    sq.set_cleanup_progress(true).await;
    let done = sq.wait_for_cleanup(Duration::from_millis(50)).await;
    assert!(done);
}

#[tokio::test(start_paused = true)]
async fn wait_for_cleanup_times_out_when_never_signalled() {
    let (sq, _rx) = new_sq();
    let wait = sq.wait_for_cleanup(Duration::from_millis(50));
    tokio::pin!(wait);
    tokio::time::advance(Duration::from_millis(60)).await;
    assert!(!wait.await);
}
