//! The previous-owner tear-down action the Service Queue runs on class change.

use crate::ServiceClass;

/// A one-shot cleanup action tagged with the service class it tears down.
///
/// Installed by whichever caller acquires the slot for `service_tag`; run at
/// most once, on the next transition to a genuinely different class (see
/// `gpuq-queue`'s arbiter for the exact firing rule). Not `Clone` — a hook
/// runs once and is then gone.
pub struct CleanupHook {
    service_tag: ServiceClass,
    run: Box<dyn FnOnce() + Send + 'static>,
}

impl CleanupHook {
    pub fn new(service_tag: ServiceClass, run: impl FnOnce() + Send + 'static) -> Self {
        Self { service_tag, run: Box::new(run) }
    }

    pub fn service_tag(&self) -> &ServiceClass {
        &self.service_tag
    }

    /// Consume and run the hook's action.
    pub fn run(self) {
        (self.run)()
    }
}

impl std::fmt::Debug for CleanupHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHook").field("service_tag", &self.service_tag).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn run_invokes_closure_exactly_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = flag.clone();
        let hook = CleanupHook::new(ServiceClass::backend("llm"), move || {
            flag2.store(true, Ordering::SeqCst);
        });
        assert_eq!(hook.service_tag(), &ServiceClass::backend("llm"));
        hook.run();
        assert!(flag.load(Ordering::SeqCst));
    }
}
