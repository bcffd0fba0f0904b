use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cosim_sync::{ReadyLatch, SleepGate};

use crate::mailbox::Mailbox;
use crate::params::Params;
use crate::sched::{ExecutorState, KernelState, QuantumFlags};
use crate::stop::StopLatch;

/// Synchronisation state owned by one bridge and shared with its executor.
pub(crate) struct Shared {
    pub(crate) kernel_gate: SleepGate,
    pub(crate) cpu_gate: SleepGate,
    pub(crate) ready: ReadyLatch,
    pub(crate) mailbox: Mailbox,
    pub(crate) flags: QuantumFlags,
    pub(crate) stop: StopLatch,
    pub(crate) params: Params,
    pub(crate) quantum_ns: u64,
    now_ns: AtomicU64,
    /// Absolute notification times requested by the CPU side, absorbed by the kernel loop.
    notify_requests: Mutex<Vec<u64>>,
    pub(crate) dmi_hits: AtomicU64,
    pub(crate) invalidations: AtomicU64,
}

impl Shared {
    pub(crate) fn new(quantum_ns: u64, params: Params) -> Self {
        Self {
            kernel_gate: SleepGate::new(),
            cpu_gate: SleepGate::new(),
            ready: ReadyLatch::new(),
            mailbox: Mailbox::new(),
            flags: QuantumFlags::default(),
            stop: StopLatch::default(),
            params,
            quantum_ns,
            now_ns: AtomicU64::new(0),
            notify_requests: Mutex::new(Vec::new()),
            dmi_hits: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub(crate) fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }

    pub(crate) fn publish_time(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    pub(crate) fn request_stop(&self) -> bool {
        let first = self.stop.request();
        if first {
            tracing::info!(now_ns = self.now_ns(), "stop requested");
        }
        self.kernel_gate.wake();
        first
    }

    pub(crate) fn request_notify(&self, delay_ns: u64) {
        let at = self.now_ns().saturating_add(delay_ns);
        self.notify_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(at);
    }

    pub(crate) fn take_notify_requests(&self) -> Vec<u64> {
        std::mem::take(
            &mut *self
                .notify_requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Thread-safe view of a running bridge: time, parameters, stop requests and counters.
///
/// Unlike [`crate::Executor`] this handle is `Sync` and can be cloned freely, e.g. into a
/// signal handler or a monitoring thread.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("now_ns", &self.now_ns())
            .field("kernel", &self.kernel_state())
            .field("executor", &self.executor_state())
            .finish_non_exhaustive()
    }
}

impl BridgeHandle {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Kernel logical time as last published by the kernel thread.
    pub fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    pub fn quantum_ns(&self) -> u64 {
        self.shared.quantum_ns
    }

    /// Asks the kernel to halt. Returns `true` for the first request only.
    pub fn request_stop(&self) -> bool {
        self.shared.request_stop()
    }

    /// Schedules a model notification `delay_ns` after the current kernel time.
    pub fn request_notify(&self, delay_ns: u64) {
        self.shared.request_notify(delay_ns);
    }

    pub fn params(&self) -> &Params {
        &self.shared.params
    }

    pub fn kernel_state(&self) -> KernelState {
        self.shared.flags.kernel_state()
    }

    pub fn executor_state(&self) -> ExecutorState {
        self.shared.flags.executor_state()
    }

    pub fn is_halted(&self) -> bool {
        self.shared.stop.is_halted()
    }

    /// Completed quanta.
    pub fn quanta(&self) -> u64 {
        self.shared.flags.quanta()
    }

    pub fn halts(&self) -> u64 {
        self.shared.stop.halts()
    }

    /// Wakes delivered to the kernel thread's gate.
    pub fn kernel_wakes(&self) -> u64 {
        self.shared.kernel_gate.wake_count()
    }

    /// Wakes delivered to the CPU thread's gate.
    pub fn cpu_wakes(&self) -> u64 {
        self.shared.cpu_gate.wake_count()
    }

    pub fn transactions_posted(&self) -> u64 {
        self.shared.mailbox.posted()
    }

    pub fn transactions_completed(&self) -> u64 {
        self.shared.mailbox.completed()
    }

    pub fn dmi_hits(&self) -> u64 {
        self.shared.dmi_hits.load(Ordering::Relaxed)
    }

    pub fn invalidations_flushed(&self) -> u64 {
        self.shared.invalidations.load(Ordering::Relaxed)
    }
}
