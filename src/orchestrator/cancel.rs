//! Cooperative cancellation.
//!
//! A [`CancelHandle`] is given to the caller; the matching [`CancelToken`]
//! travels into the run loop and agent futures. Cancellation is observed at
//! dispatch boundaries and around agent calls; in-flight work is awaited, not
//! aborted, so state is never applied half-way.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag, checked cooperatively.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// The caller-facing handle for this token.
    #[must_use]
    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            flag: Arc::clone(&self.flag),
        }
    }
}

/// Caller-side trigger; cloneable and usable from any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_flips_token() {
        let token = CancelToken::new();
        let handle = token.handle();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        // Clones observe the same flag.
        assert!(token.clone().is_cancelled());
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
