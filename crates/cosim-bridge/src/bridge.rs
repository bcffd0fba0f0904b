//! Kernel-thread side of the bridge: the builder, the embedded event loop and the quantum
//! state machine.

use std::sync::{Arc, Weak};

use cosim_mem::{
    irq_transaction, DeviceWindow, DmiBacking, InvalidationHook, InvalidationLog, IrqSink,
    Response, TargetCtx, Transaction, Transport,
};

use crate::clock::{KernelEvent, LogicalClock, TimerQueue};
use crate::config::{BridgeConfig, DmiMode};
use crate::error::{BridgeError, Result};
use crate::executor::{Executor, FastPath};
use crate::sched::KernelState;
use crate::shared::{BridgeHandle, Shared};

/// Why [`Bridge::run`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    StopRequested,
    /// `max_quanta` quanta completed.
    QuantumLimit,
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub reason: HaltReason,
    pub now_ns: u64,
    pub quanta: u64,
    pub transactions: u64,
    pub dmi_hits: u64,
}

/// Interrupt sink used when none is attached.
struct UnboundIrqSink;

impl IrqSink for UnboundIrqSink {
    fn transport(&mut self, txn: &mut Transaction) {
        tracing::warn!(line = txn.address, "interrupt raised with no sink attached");
        txn.response = Response::AddressError;
    }
}

enum DmiSource {
    None,
    Host(Arc<DmiBacking>),
    Device(DeviceWindow),
}

type NotifyFn = Box<dyn FnMut(u64) + Send>;

pub struct BridgeBuilder {
    config: BridgeConfig,
    transport: Option<Box<dyn Transport>>,
    irq: Option<Box<dyn IrqSink>>,
    hook: Option<Box<dyn InvalidationHook>>,
    dmi: DmiSource,
    notify: Option<NotifyFn>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            transport: None,
            irq: None,
            hook: None,
            dmi: DmiSource::None,
            notify: None,
        }
    }

    /// Kernel-owned target for mailbox transactions.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Receiver for interrupts forwarded to the CPU side.
    pub fn irq_sink(mut self, sink: impl IrqSink + 'static) -> Self {
        self.irq = Some(Box::new(sink));
        self
    }

    /// Called on the kernel thread for every flushed DMI invalidation.
    pub fn invalidation_hook(mut self, hook: impl InvalidationHook + 'static) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Host-memory DMI. Used for the fast path when the config selects [`DmiMode::Host`];
    /// invalidations are applied to it in every mode.
    ///
    /// The bridge keeps only weak references. The caller (normally the [`cosim_mem::MemoryMap`]
    /// it is mapped into) owns the store; dropping it revokes the fast path.
    pub fn dmi_host(mut self, backing: Arc<DmiBacking>) -> Self {
        self.dmi = DmiSource::Host(backing);
        self
    }

    /// Device-memory DMI, used when the config selects [`DmiMode::Device`].
    pub fn dmi_device(mut self, window: DeviceWindow) -> Self {
        self.dmi = DmiSource::Device(window);
        self
    }

    /// Called on the kernel thread, with the current time, for every model notification.
    pub fn on_notify(mut self, notify: impl FnMut(u64) + Send + 'static) -> Self {
        self.notify = Some(Box::new(notify));
        self
    }

    pub fn build(self) -> Result<(Bridge, Executor)> {
        let config = self.config;
        config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| BridgeError::Config("no kernel-side transport attached".into()))?;

        let base = config.dmi.base_address;
        let check_base = |actual: u64| {
            if actual == base {
                Ok(())
            } else {
                Err(BridgeError::Config(format!(
                    "dmi.base_address 0x{base:x} does not match the attached window at 0x{actual:x}"
                )))
            }
        };
        let (fast_path, backing) = match (config.dmi.mode, self.dmi) {
            (DmiMode::Off, DmiSource::Host(backing)) => (None, Some(Arc::downgrade(&backing))),
            (DmiMode::Off, _) => (None, None),
            (DmiMode::Host, DmiSource::Host(backing)) => {
                check_base(backing.base())?;
                (Some(FastPath::Host(backing.view())), Some(Arc::downgrade(&backing)))
            }
            (DmiMode::Device, DmiSource::Device(window)) => {
                check_base(window.base())?;
                (Some(FastPath::Device(window)), None)
            }
            (mode, _) => {
                return Err(BridgeError::Config(format!(
                    "dmi mode `{}` has no matching window attached",
                    mode.as_str()
                )))
            }
        };

        let shared = Arc::new(Shared::new(config.quantum_ns, config.to_params()));
        let kernel = KernelSide {
            shared: shared.clone(),
            transport,
            irq: self.irq.unwrap_or_else(|| Box::new(UnboundIrqSink)),
            log: InvalidationLog::new(),
            hook: self.hook,
            backing,
        };
        tracing::debug!(
            quantum_ns = config.quantum_ns,
            dmi = config.dmi.mode.as_str(),
            "bridge built"
        );

        let bridge = Bridge {
            shared: shared.clone(),
            kernel,
            clock: LogicalClock::new(),
            timers: TimerQueue::new(),
            next_quantum_ns: 0,
            max_quanta: config.max_quanta,
            initialized: false,
            notify: self.notify,
        };
        Ok((bridge, Executor::new(shared, fast_path)))
    }
}

/// Kernel-owned state reached while executing a transaction.
struct KernelSide {
    shared: Arc<Shared>,
    transport: Box<dyn Transport>,
    irq: Box<dyn IrqSink>,
    log: InvalidationLog,
    hook: Option<Box<dyn InvalidationHook>>,
    /// The memory side owns the backing; once it lets go, direct access is revoked.
    backing: Option<Weak<DmiBacking>>,
}

impl KernelSide {
    fn execute(&mut self, now_ns: u64, txn: &mut Transaction) {
        let mut ctx = TargetCtx::new(now_ns, &mut self.log, &mut *self.irq);
        self.transport.transport(txn, &mut ctx);
        if txn.response == Response::Incomplete {
            tracing::warn!(address = txn.address, "target left the transaction incomplete");
            txn.response = Response::AddressError;
        }
        self.flush_invalidations();
    }

    fn flush_invalidations(&mut self) {
        let Some(range) = self.log.take() else {
            return;
        };
        if let Some(backing) = self.backing.as_ref().and_then(Weak::upgrade) {
            backing.invalidate(range.clone());
        }
        tracing::debug!(start = range.start, end = range.end, "flushing DMI invalidation");
        if let Some(hook) = &mut self.hook {
            hook.invalidate(range);
        }
        self.shared
            .invalidations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// The kernel side of one CPU/kernel pairing. [`Bridge::run`] must be called on the thread that
/// owns the simulation; it is the only thread that touches the transport and memory targets.
pub struct Bridge {
    shared: Arc<Shared>,
    kernel: KernelSide,
    clock: LogicalClock,
    /// Model notifications only; the quantum timer is always armed and lives here.
    timers: TimerQueue,
    next_quantum_ns: u64,
    max_quanta: Option<u64>,
    initialized: bool,
    notify: Option<NotifyFn>,
}

impl Bridge {
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle::new(self.shared.clone())
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    pub fn set_irq_sink(&mut self, sink: impl IrqSink + 'static) {
        self.kernel.irq = Box::new(sink);
    }

    pub fn set_notify_handler(&mut self, notify: impl FnMut(u64) + Send + 'static) {
        self.notify = Some(Box::new(notify));
    }

    pub fn set_invalidation_hook(&mut self, hook: impl InvalidationHook + 'static) {
        self.kernel.hook = Some(Box::new(hook));
    }

    /// Forwards an interrupt to the CPU side.
    pub fn irq(&mut self, line: u64, value: u64) -> Response {
        let mut txn = irq_transaction(line, value);
        self.kernel.irq.transport(&mut txn);
        txn.response
    }

    /// Records a DMI invalidation from outside a transaction. It is flushed before the next
    /// mailbox completion.
    pub fn invalidate_direct_mem_ptr(&mut self, start: u64, end: u64) {
        self.kernel.log.record(start, end);
    }

    /// Runs the kernel until a stop request or the quantum limit.
    pub fn run(&mut self) -> Result<RunReport> {
        if self.shared.stop.is_halted() {
            return Err(BridgeError::Halted);
        }
        tracing::info!(quantum_ns = self.shared.quantum_ns, "kernel starting");
        self.next_quantum_ns = self.clock.now_ns();

        let reason = loop {
            if self.shared.stop.is_requested() {
                break HaltReason::StopRequested;
            }
            self.service();
            let (at, event) = self.next_event();
            self.clock.advance_to(at);
            self.shared.publish_time(at);
            match event {
                KernelEvent::QuantumTimer => {
                    if let Some(reason) = self.quantum_expired() {
                        break reason;
                    }
                }
                KernelEvent::ModelNotify => {
                    if let Some(notify) = &mut self.notify {
                        notify(at);
                    }
                }
            }
        };
        self.halt(reason);
        Ok(self.report(reason))
    }

    fn report(&self, reason: HaltReason) -> RunReport {
        RunReport {
            reason,
            now_ns: self.clock.now_ns(),
            quanta: self.shared.flags.quanta(),
            transactions: self.shared.mailbox.completed(),
            dmi_hits: self
                .shared
                .dmi_hits
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    /// The earliest pending notification, or the quantum timer. A notification due at the
    /// quantum boundary fires first.
    fn next_event(&mut self) -> (u64, KernelEvent) {
        let quantum = (self.next_quantum_ns, KernelEvent::QuantumTimer);
        if self.timers.next_deadline().is_some_and(|at| at <= quantum.0) {
            self.timers.pop().unwrap_or(quantum)
        } else {
            quantum
        }
    }

    /// Work done between events and on every kernel wake.
    fn service(&mut self) {
        self.drain_one();
        for at in self.shared.take_notify_requests() {
            self.timers
                .schedule(at.max(self.clock.now_ns()), KernelEvent::ModelNotify);
        }
        self.kernel.flush_invalidations();
    }

    fn drain_one(&mut self) -> bool {
        let now_ns = self.clock.now_ns();
        let kernel = &mut self.kernel;
        self.shared.mailbox.drain(|txn| kernel.execute(now_ns, txn))
    }

    /// Quantum timer handler. Returns a halt reason if the kernel must stop.
    fn quantum_expired(&mut self) -> Option<HaltReason> {
        let quantum_ns = self.shared.quantum_ns;
        if !self.initialized {
            self.initialized = true;
            self.next_quantum_ns = self.clock.after(quantum_ns);
            self.shared.ready.open();
            tracing::debug!("bridge initialized, executor released");
            return None;
        }

        self.shared.flags.kernel_quantum_done();
        tracing::trace!(now_ns = self.clock.now_ns(), "kernel waiting for executor");
        loop {
            if self.shared.stop.is_requested() {
                return Some(HaltReason::StopRequested);
            }
            self.service();
            if self.shared.flags.executor_finished() {
                break;
            }
            self.shared.kernel_gate.sleep();
        }

        let quanta = self.shared.flags.complete_quantum();
        tracing::debug!(quanta, now_ns = self.clock.now_ns(), "quantum completed");
        if self.max_quanta.is_some_and(|max| quanta >= max) {
            return Some(HaltReason::QuantumLimit);
        }
        self.next_quantum_ns = self.clock.after(quantum_ns);
        self.shared.cpu_gate.wake();
        None
    }

    fn halt(&mut self, reason: HaltReason) {
        if self.shared.stop.is_halted() {
            return;
        }
        // Finish a transaction that is already in flight before refusing new ones.
        self.drain_one();
        self.kernel.flush_invalidations();
        self.shared.mailbox.close();
        self.shared.flags.halt();
        self.shared.stop.mark_halted();
        self.shared.ready.open();
        self.shared.cpu_gate.wake();
        tracing::info!(
            ?reason,
            now_ns = self.clock.now_ns(),
            quanta = self.shared.flags.quanta(),
            "kernel halted"
        );
    }

    pub fn kernel_state(&self) -> KernelState {
        self.shared.flags.kernel_state()
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.halt(HaltReason::Dropped);
    }
}
