//! CPU-thread side of the bridge.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use cosim_mem::{DeviceWindow, DmiAccess, DmiView, Response, Transaction};

use crate::error::{BridgeError, Result};
use crate::mailbox::PostError;
use crate::params::Params;
use crate::sched::{ExecutorState, QuantumExit};
use crate::shared::{BridgeHandle, Shared};

pub(crate) enum FastPath {
    Host(DmiView),
    Device(DeviceWindow),
}

impl FastPath {
    fn access(&self, txn: &mut Transaction) -> DmiAccess {
        match self {
            FastPath::Host(view) => view.access(txn),
            FastPath::Device(window) => window.access(txn),
        }
    }
}

/// The CPU model's handle onto the bridge.
///
/// There is exactly one executor per bridge and it belongs to the execution thread: it is
/// `Send` but not `Sync`, so only one thread can be posting transactions or ending quanta.
/// Dropping it requests a stop so the kernel never waits on a CPU that is gone.
pub struct Executor {
    shared: Arc<Shared>,
    fast_path: Option<FastPath>,
    _not_sync: PhantomData<Cell<()>>,
}

impl Executor {
    pub(crate) fn new(shared: Arc<Shared>, fast_path: Option<FastPath>) -> Self {
        Self {
            shared,
            fast_path,
            _not_sync: PhantomData,
        }
    }

    /// Blocks until the kernel has run its zero-time initialization (or halted).
    pub fn wait_ready(&self) {
        self.shared.ready.wait();
        if !self.shared.stop.is_halted() {
            self.shared.flags.set_executor(ExecutorState::Running);
        }
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.is_open()
    }

    /// Performs a CPU-originated bus transaction.
    ///
    /// DMI-eligible accesses complete directly against the backing store and never involve
    /// the kernel thread. Everything else is posted to the kernel and blocks until it has been
    /// executed. A transaction that cannot be delivered completes with
    /// [`Response::AddressError`].
    pub fn transport(&self, txn: &mut Transaction) {
        if let Some(fast_path) = &self.fast_path {
            match fast_path.access(txn) {
                DmiAccess::Hit => {
                    self.shared.dmi_hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(address = txn.address, size = txn.size(), "DMI access");
                    return;
                }
                DmiAccess::Revoked => {
                    tracing::debug!(address = txn.address, "DMI access revoked, using mailbox");
                }
                DmiAccess::OutOfWindow => {}
            }
        }

        match self.post(txn.clone()) {
            Ok(done) => *txn = done,
            Err(err) => {
                tracing::warn!(address = txn.address, size = txn.size(), "transaction dropped: {err}");
                txn.response = Response::AddressError;
            }
        }
    }

    /// Posts `txn` to the kernel thread, bypassing the DMI fast path.
    pub fn post(&self, txn: Transaction) -> std::result::Result<Transaction, PostError> {
        self.shared.mailbox.post(txn, &self.shared.kernel_gate)
    }

    pub fn read(&self, address: u64, size: u32) -> Transaction {
        let mut txn = Transaction::read(address, size);
        self.transport(&mut txn);
        txn
    }

    pub fn write(&self, address: u64, data: impl Into<Vec<u8>>) -> Response {
        let mut txn = Transaction::write(address, data);
        self.transport(&mut txn);
        txn.response
    }

    /// `None` if the read completed with an error.
    pub fn read_u32(&self, address: u64) -> Option<u32> {
        let txn = self.read(address, 4);
        txn.response.is_ok().then(|| txn.value_le() as u32)
    }

    pub fn write_u32(&self, address: u64, value: u32) -> Response {
        self.write(address, value.to_le_bytes().to_vec())
    }

    /// Ends the current quantum: hands control to the kernel and sleeps until it has caught up.
    pub fn end_of_quantum(&self) -> QuantumExit {
        let shared = &self.shared;
        if shared.stop.is_halted() {
            shared.flags.set_executor(ExecutorState::Stopped);
            return QuantumExit::Stopped;
        }

        shared.flags.executor_quantum_done();
        shared.kernel_gate.wake();
        shared.cpu_gate.sleep();

        if shared.stop.is_halted() {
            shared.flags.set_executor(ExecutorState::Stopped);
            QuantumExit::Stopped
        } else {
            QuantumExit::Continue
        }
    }

    /// Asks the kernel to halt. Returns `true` for the first request only.
    pub fn request_stop(&self) -> bool {
        self.shared.request_stop()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_halted()
    }

    pub fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    pub fn quantum_ns(&self) -> u64 {
        self.shared.quantum_ns
    }

    /// Schedules a model notification `delay_ns` after the current kernel time.
    pub fn request_notify(&self, delay_ns: u64) {
        self.shared.request_notify(delay_ns);
    }

    pub fn params(&self) -> &Params {
        &self.shared.params
    }

    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle::new(self.shared.clone())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shared.flags.set_executor(ExecutorState::Stopped);
        if self.shared.request_stop() {
            tracing::debug!("executor dropped, stopping the kernel");
        }
    }
}

/// An in-process CPU model driven on its own thread. It runs exactly once.
pub trait CpuModel: Send {
    /// Runs until the model is done or [`Executor::end_of_quantum`] returns
    /// [`QuantumExit::Stopped`].
    fn run(self, exec: &Executor);
}

impl<F> CpuModel for F
where
    F: FnOnce(&Executor) + Send,
{
    fn run(self, exec: &Executor) {
        self(exec)
    }
}

/// Spawns the execution thread: it waits for readiness, runs `model` and then releases the
/// executor, which stops the kernel if the model returned on its own.
pub fn spawn_cpu(exec: Executor, model: impl CpuModel + 'static) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("cosim-cpu".into())
        .spawn(move || {
            exec.wait_ready();
            if !exec.is_stopped() {
                tracing::debug!("CPU model starting");
                model.run(&exec);
            }
        })
        .map_err(|source| BridgeError::ThreadSpawn {
            name: "cosim-cpu",
            source,
        })
}
