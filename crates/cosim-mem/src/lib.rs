//! Memory-side building blocks of the bridge: bus transactions, the kernel-side transport seam,
//! backing RAM, and the two direct-memory-interface (DMI) fast paths.
//!
//! Everything that implements [`Transport`] is kernel-owned and only ever driven from the
//! kernel thread. The DMI types are the single exception to that rule: [`DmiView`] and
//! [`DeviceWindow`] are used from the CPU thread and reach the backing storage through a guard
//! lock held for exactly one copy.

#![forbid(unsafe_code)]

mod device;
mod dmi;
mod invalidate;
mod map;
mod ram;
mod target;
mod txn;

pub use device::{DeviceError, DeviceWindow, PeekPoke, ScratchBar};
pub use dmi::{DmiAccess, DmiBacking, DmiView};
pub use invalidate::{InvalidationHook, InvalidationLog};
pub use map::{MapError, MemoryMap, MmioHandler};
pub use ram::{DenseRam, MemoryError, MemoryResult, RamStore, SparseRam};
pub use target::{irq_transaction, IrqSink, PendingIrqs, TargetCtx, Transport};
pub use txn::{Direction, Response, Transaction};

pub(crate) fn lock<T: ?Sized>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
