use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::invalidate::InvalidationLog;
use crate::txn::{Response, Transaction};

/// Receives interrupt signals, delivered as write transactions.
///
/// The transaction address is the interrupt line and the data is the line value as 8
/// little-endian bytes (see [`irq_transaction`]).
pub trait IrqSink: Send {
    fn transport(&mut self, txn: &mut Transaction);
}

/// Encodes an interrupt `(line, value)` pair as a write transaction.
pub fn irq_transaction(line: u64, value: u64) -> Transaction {
    Transaction::write(line, value.to_le_bytes().to_vec())
}

/// Kernel-thread context handed to a [`Transport`] while it executes a transaction.
pub struct TargetCtx<'a> {
    now_ns: u64,
    invalidations: &'a mut InvalidationLog,
    irq: &'a mut dyn IrqSink,
}

impl<'a> TargetCtx<'a> {
    pub fn new(now_ns: u64, invalidations: &'a mut InvalidationLog, irq: &'a mut dyn IrqSink) -> Self {
        Self {
            now_ns,
            invalidations,
            irq,
        }
    }

    /// Kernel logical time at which the transaction executes.
    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    /// Records that direct views into `[start, end)` are no longer valid.
    ///
    /// The invalidation is deferred: it is flushed to the memory owner before the current
    /// transaction's completion becomes visible to the CPU thread.
    pub fn invalidate_direct_mem_ptr(&mut self, start: u64, end: u64) {
        self.invalidations.record(start, end);
    }

    /// Forwards an interrupt to the CPU side. Returns the sink's response.
    pub fn raise_irq(&mut self, line: u64, value: u64) -> Response {
        let mut txn = irq_transaction(line, value);
        self.irq.transport(&mut txn);
        txn.response
    }
}

/// A kernel-owned target for memory transactions.
///
/// Implementations must fill in `txn.response`; reads also fill `txn.data`.
pub trait Transport: Send {
    fn transport(&mut self, txn: &mut Transaction, ctx: &mut TargetCtx<'_>);
}

/// In-process interrupt sink: a queue of `(line, value)` pairs the CPU model drains.
#[derive(Clone, Debug, Default)]
pub struct PendingIrqs {
    queue: Arc<Mutex<VecDeque<(u64, u64)>>>,
}

impl PendingIrqs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<(u64, u64)> {
        crate::lock(&self.queue).pop_front()
    }

    pub fn take_all(&self) -> Vec<(u64, u64)> {
        crate::lock(&self.queue).drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        crate::lock(&self.queue).is_empty()
    }
}

impl IrqSink for PendingIrqs {
    fn transport(&mut self, txn: &mut Transaction) {
        if txn.is_read() {
            txn.response = Response::AddressError;
            return;
        }
        let line = txn.address;
        let value = txn.value_le();
        tracing::trace!(line, value, "irq queued");
        crate::lock(&self.queue).push_back((line, value));
        txn.response = Response::Ok;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_irq_reaches_pending_queue() {
        let irqs = PendingIrqs::new();
        let mut sink = irqs.clone();
        let mut log = InvalidationLog::new();
        let mut ctx = TargetCtx::new(42, &mut log, &mut sink);

        assert_eq!(ctx.raise_irq(3, 1), Response::Ok);
        assert_eq!(ctx.raise_irq(3, 0), Response::Ok);
        assert_eq!(ctx.now_ns(), 42);

        assert_eq!(irqs.take_all(), vec![(3, 1), (3, 0)]);
        assert!(irqs.is_empty());
    }

    #[test]
    fn reads_on_an_irq_sink_are_address_errors() {
        let mut sink = PendingIrqs::new();
        let mut txn = Transaction::read(3, 8);
        sink.transport(&mut txn);
        assert_eq!(txn.response, Response::AddressError);
        assert!(sink.is_empty());
    }

    #[test]
    fn invalidations_from_ctx_are_deferred_into_the_log() {
        let mut sink = PendingIrqs::new();
        let mut log = InvalidationLog::new();
        {
            let mut ctx = TargetCtx::new(0, &mut log, &mut sink);
            ctx.invalidate_direct_mem_ptr(0x1000, 0x2000);
        }
        assert_eq!(log.take(), Some(0x1000..0x2000));
    }
}
