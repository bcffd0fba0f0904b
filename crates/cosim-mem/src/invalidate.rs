use std::ops::Range;

/// Receives DMI invalidations once they are flushed by the kernel thread.
///
/// The owner of a DMI-capable backing store implements this to drop (or refresh) whatever
/// direct views it handed out for the range.
pub trait InvalidationHook: Send {
    fn invalidate(&mut self, range: Range<u64>);
}

impl<F> InvalidationHook for F
where
    F: FnMut(Range<u64>) + Send,
{
    fn invalidate(&mut self, range: Range<u64>) {
        self(range)
    }
}

/// Deferred DMI invalidation recorded on the kernel thread.
///
/// Targets record invalidations while executing a transaction; the bridge flushes the log
/// before it signals that transaction's completion. Several records between two flushes merge
/// into the smallest range covering all of them.
#[derive(Debug, Default)]
pub struct InvalidationLog {
    pending: Option<Range<u64>>,
    recorded: u64,
}

impl InvalidationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `[start, end)`. Empty ranges are ignored.
    pub fn record(&mut self, start: u64, end: u64) {
        if start >= end {
            tracing::trace!(start, end, "ignoring empty DMI invalidation");
            return;
        }
        self.recorded += 1;
        self.pending = Some(match self.pending.take() {
            Some(prev) => prev.start.min(start)..prev.end.max(end),
            None => start..end,
        });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Takes the merged pending range, leaving the log empty.
    pub fn take(&mut self) -> Option<Range<u64>> {
        self.pending.take()
    }

    /// Total number of non-empty ranges recorded since creation.
    pub fn recorded(&self) -> u64 {
        self.recorded
    }
}
