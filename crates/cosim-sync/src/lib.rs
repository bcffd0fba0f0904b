//! Cross-thread handoff primitives for the CPU/kernel bridge.
//!
//! Both primitives are plain mutex + condition-variable constructions. They are built with the
//! `loom` feature swapped in under `cfg(test)` so the wake/sleep protocols can be model checked.

#![forbid(unsafe_code)]

mod gate;
mod latch;

pub use gate::{GateState, SleepGate};
pub use latch::ReadyLatch;

#[cfg(all(feature = "loom", test))]
pub(crate) use loom::sync::{Condvar, Mutex, MutexGuard};
#[cfg(not(all(feature = "loom", test)))]
pub(crate) use std::sync::{Condvar, Mutex, MutexGuard};

/// Locks `mutex`, recovering the guard if a panicking holder poisoned it.
///
/// The state behind every lock in this crate is a small enum that is valid at every await point,
/// so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
