//! Quantum bookkeeping shared by the kernel loop and the executor.

use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KernelState {
    /// Processing events and draining the mailbox between them.
    #[default]
    Running,
    /// Quantum consumed; draining the mailbox until the executor finishes its quantum.
    WaitingForExecutor,
    Halted,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ExecutorState {
    /// Blocked on the readiness latch, or not spawned yet.
    #[default]
    NotStarted,
    Running,
    /// Quantum consumed; sleeping until the kernel catches up.
    WaitingForKernel,
    Stopped,
}

/// What [`crate::Executor::end_of_quantum`] returned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuantumExit {
    /// A new quantum has started.
    Continue,
    /// The kernel halted; the CPU model should return.
    Stopped,
}

#[derive(Debug, Default)]
struct Flags {
    kernel: KernelState,
    executor: ExecutorState,
    kernel_finished: bool,
    executor_finished: bool,
    quanta: u64,
}

#[derive(Debug, Default)]
pub(crate) struct QuantumFlags {
    inner: Mutex<Flags>,
}

impl QuantumFlags {
    fn lock(&self) -> MutexGuard<'_, Flags> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn kernel_state(&self) -> KernelState {
        self.lock().kernel
    }

    pub(crate) fn executor_state(&self) -> ExecutorState {
        self.lock().executor
    }

    pub(crate) fn quanta(&self) -> u64 {
        self.lock().quanta
    }

    pub(crate) fn set_executor(&self, state: ExecutorState) {
        let mut flags = self.lock();
        if flags.executor != ExecutorState::Stopped {
            flags.executor = state;
        }
    }

    /// Kernel side: the quantum timer fired after initialization.
    pub(crate) fn kernel_quantum_done(&self) {
        let mut flags = self.lock();
        flags.kernel_finished = true;
        flags.kernel = KernelState::WaitingForExecutor;
    }

    /// Executor side: the CPU model consumed its quantum.
    pub(crate) fn executor_quantum_done(&self) {
        let mut flags = self.lock();
        flags.executor_finished = true;
        if flags.executor != ExecutorState::Stopped {
            flags.executor = ExecutorState::WaitingForKernel;
        }
    }

    pub(crate) fn executor_finished(&self) -> bool {
        self.lock().executor_finished
    }

    /// Both sides finished: resets the flags, resumes both states and returns the number of
    /// completed quanta.
    pub(crate) fn complete_quantum(&self) -> u64 {
        let mut flags = self.lock();
        debug_assert!(flags.kernel_finished && flags.executor_finished);
        flags.kernel_finished = false;
        flags.executor_finished = false;
        flags.quanta += 1;
        flags.kernel = KernelState::Running;
        if flags.executor != ExecutorState::Stopped {
            flags.executor = ExecutorState::Running;
        }
        flags.quanta
    }

    pub(crate) fn halt(&self) {
        self.lock().kernel = KernelState::Halted;
    }
}
