//! Quantum-synchronised bridge between a free-running CPU model thread and a single-threaded
//! discrete-event simulation kernel.
//!
//! [`BridgeBuilder::build`] returns the two halves of one pairing: a [`Bridge`], whose
//! [`Bridge::run`] is the kernel thread's event loop, and an [`Executor`], which the CPU model
//! uses from its own thread to issue bus transactions and hand over at quantum boundaries.
//!
//! Unsafe code is confined to [`module`], the C boundary to dynamically loaded CPU models.

mod bridge;
mod clock;
mod config;
mod error;
mod executor;
mod mailbox;
pub mod module;
mod params;
mod sched;
mod shared;
mod stop;

pub use bridge::{Bridge, BridgeBuilder, HaltReason, RunReport};
pub use clock::{KernelEvent, LogicalClock, TimerQueue};
pub use config::{BridgeConfig, DmiConfig, DmiMode, DEFAULT_QUANTUM_NS};
pub use error::{BridgeError, Result};
pub use executor::{spawn_cpu, CpuModel, Executor};
pub use mailbox::{Mailbox, PostError};
pub use module::{CpuModule, ModuleEntryPoints, ModuleLease, ModuleRegistry};
pub use params::{ParamValue, Params};
pub use sched::{ExecutorState, KernelState, QuantumExit};
pub use shared::BridgeHandle;
