//! Single-slot transaction handoff from the CPU thread to the kernel thread.
//!
//! The CPU thread posts one transaction and blocks on the mailbox's own completion condition
//! until the kernel thread has executed it. There is never more than one transaction in flight,
//! so completion order is submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use cosim_mem::Transaction;
use cosim_sync::SleepGate;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum PostError {
    /// Another transaction is already in flight.
    #[error("a transaction is already in flight")]
    Busy,
    /// The kernel has halted; no further transactions will be executed.
    #[error("mailbox is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct Slot {
    pending: Option<Transaction>,
    completed: Option<Transaction>,
    in_flight: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Slot>,
    done: Condvar,
    posted: AtomicU64,
    completed: AtomicU64,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Posts `txn`, wakes `kernel` and blocks until the kernel thread completes it.
    ///
    /// CPU thread only.
    pub fn post(&self, txn: Transaction, kernel: &SleepGate) -> Result<Transaction, PostError> {
        {
            let mut slot = self.slot();
            if slot.closed {
                return Err(PostError::Closed);
            }
            if slot.in_flight {
                return Err(PostError::Busy);
            }
            tracing::trace!(address = txn.address, size = txn.size(), "posting transaction");
            slot.completed = None;
            slot.pending = Some(txn);
            slot.in_flight = true;
        }
        self.posted.fetch_add(1, Ordering::Relaxed);
        kernel.wake();

        let mut slot = self.slot();
        loop {
            if let Some(done) = slot.completed.take() {
                slot.in_flight = false;
                return Ok(done);
            }
            if slot.closed {
                // Closed before the kernel got to it.
                slot.pending = None;
                slot.in_flight = false;
                return Err(PostError::Closed);
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Executes the pending transaction, if any, with `execute` and signals its completion.
    ///
    /// Kernel thread only. `execute` runs without the mailbox lock held; anything it must make
    /// visible to the CPU thread (deferred DMI invalidations in particular) has to be done
    /// before it returns. Returns `true` if a transaction was executed.
    pub fn drain(&self, execute: impl FnOnce(&mut Transaction)) -> bool {
        let Some(mut txn) = self.slot().pending.take() else {
            return false;
        };
        execute(&mut txn);

        let mut slot = self.slot();
        slot.completed = Some(txn);
        self.completed.fetch_add(1, Ordering::Relaxed);
        drop(slot);
        self.done.notify_all();
        true
    }

    /// Fails the pending post, if any, and all future posts with [`PostError::Closed`].
    pub fn close(&self) {
        let mut slot = self.slot();
        if slot.closed {
            return;
        }
        slot.closed = true;
        drop(slot);
        self.done.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.slot().closed
    }

    pub fn has_pending(&self) -> bool {
        self.slot().pending.is_some()
    }

    /// Transactions accepted by [`Mailbox::post`].
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Transactions executed by [`Mailbox::drain`].
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}
