use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Kernel logical time in nanoseconds. Only the kernel thread advances it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogicalClock {
    now_ns: u64,
}

impl LogicalClock {
    pub const fn new() -> Self {
        Self { now_ns: 0 }
    }

    #[inline]
    pub const fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Moves the clock forward to `at_ns`. Never moves it backwards.
    #[inline]
    pub fn advance_to(&mut self, at_ns: u64) {
        debug_assert!(at_ns >= self.now_ns, "logical clock moved backwards");
        self.now_ns = self.now_ns.max(at_ns);
    }

    /// `now + delta`, saturating at the end of time.
    #[inline]
    pub fn after(&self, delta_ns: u64) -> u64 {
        self.now_ns.saturating_add(delta_ns)
    }
}

/// Events the embedded kernel schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum KernelEvent {
    QuantumTimer,
    ModelNotify,
}

/// Time-ordered event queue. Events scheduled for the same instant fire in scheduling order.
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<(u64, u64, KernelEvent)>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at_ns: u64, event: KernelEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse((at_ns, seq, event)));
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.heap.peek().map(|Reverse((at, _, _))| *at)
    }

    pub fn pop(&mut self) -> Option<(u64, KernelEvent)> {
        self.heap.pop().map(|Reverse((at, _, event))| (at, event))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
