use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Stop request plus the halt it eventually causes.
///
/// Any number of requests, from any thread, collapse into one halt.
#[derive(Debug, Default)]
pub(crate) struct StopLatch {
    requested: AtomicBool,
    halted: AtomicBool,
    halts: AtomicU64,
}

impl StopLatch {
    /// Returns `true` for the first request only.
    pub(crate) fn request(&self) -> bool {
        !self.requested.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Returns `true` if this call performed the halt.
    pub(crate) fn mark_halted(&self) -> bool {
        if self.halted.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.halts.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn halts(&self) -> u64 {
        self.halts.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_requests_and_halts_collapse() {
        let stop = StopLatch::default();
        assert!(stop.request());
        assert!(!stop.request());
        assert!(stop.is_requested());

        assert!(stop.mark_halted());
        assert!(!stop.mark_halted());
        assert_eq!(stop.halts(), 1);
    }
}
