//! One-shot readiness latch.
//!
//! The CPU thread must not execute its first instruction before the kernel has run its
//! zero-time initialization. It parks on a [`ReadyLatch`] which the kernel opens exactly once.

use std::sync::PoisonError;

use crate::{lock, Condvar, Mutex};

#[derive(Debug)]
pub struct ReadyLatch {
    open: Mutex<bool>,
    cond: Condvar,
}

impl ReadyLatch {
    pub fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Opens the latch and releases every waiter.
    ///
    /// Returns `true` for the call that actually opened it.
    pub fn open(&self) -> bool {
        let mut open = lock(&self.open);
        if *open {
            return false;
        }
        *open = true;
        self.cond.notify_all();
        tracing::trace!("ready latch opened");
        true
    }

    /// Blocks until the latch is open. Returns immediately once it has been opened.
    pub fn wait(&self) {
        let mut open = lock(&self.open);
        while !*open {
            open = self
                .cond
                .wait(open)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }
}

impl Default for ReadyLatch {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn open_races_wait() {
        loom::model(|| {
            let latch = Arc::new(ReadyLatch::new());
            let opener = latch.clone();
            let handle = thread::spawn(move || {
                opener.open();
            });
            latch.wait();
            assert!(latch.is_open());
            handle.join().unwrap();
        });
    }
}
