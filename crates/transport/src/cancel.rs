//! Cancellation token for connect attempts
//!
//! Setting the flag alone cannot wake a thread blocked inside `connect(2)`,
//! so a transport may register a hook that closes the resource being waited
//! on. The hook runs at most once, either on `cancel()` or immediately on
//! registration if the token is already cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

type CancelHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    hook: Mutex<Option<CancelHook>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the attempt and run the registered hook, if any
    ///
    /// Calling this more than once is a no-op.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self
            .hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(hook) = hook {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Register the hook that unblocks the in-progress handshake
    ///
    /// Replaces any earlier hook. Runs `hook` right away if the token was
    /// cancelled before registration.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut slot = self.hook.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(slot);
            hook();
            return;
        }
        *slot = Some(Box::new(hook));
    }

    /// Drop the registered hook once the handshake no longer needs it
    pub fn clear_hook(&self) {
        self.hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
