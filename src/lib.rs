//! Quantum-synchronised bridge between a free-running CPU model thread and a single-threaded
//! discrete-event simulation kernel.
//!
//! The pieces live in their own crates; this crate re-exports them under one roof:
//!
//! - [`sync`]: sleep gates and the readiness latch.
//! - [`mem`]: transactions, the transport seam, RAM stores, the memory map and the DMI fast path.
//! - [`bridge`]: the mailbox, quantum scheduler, stop protocol, executor handle and module loader.

pub use cosim_bridge as bridge;
pub use cosim_mem as mem;
pub use cosim_sync as sync;

pub use cosim_bridge::{
    spawn_cpu, Bridge, BridgeBuilder, BridgeConfig, BridgeError, BridgeHandle, CpuModel, DmiMode,
    Executor, HaltReason, QuantumExit, RunReport,
};
pub use cosim_mem::{Response, Transaction, Transport};
