//! Sleep/wake gate owned by one thread role.
//!
//! Each side of the bridge parks on its own gate. The other side (or any number of independent
//! producers) wakes it. Wakes that arrive before the sleep are retained, and any number of them
//! coalesce into a single pending wake: the sleeper re-checks its own condition flags after
//! every return from [`SleepGate::sleep`], so it never needs to know how many reasons there were.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU64;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU64;

use std::sync::atomic::Ordering;
use std::sync::PoisonError;

use crate::{lock, Condvar, Mutex};

/// Observable state of a [`SleepGate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Owner is running and no wake is outstanding.
    Idle,
    /// At least one wake has been delivered and not yet consumed by a sleep.
    WakePending,
    /// Owner is blocked inside [`SleepGate::sleep`].
    Sleeping,
}

/// A single-sleeper gate with coalescing wakes.
///
/// Transitions:
///
/// | state         | `wake()`                    | `sleep()`                         |
/// |---------------|-----------------------------|-----------------------------------|
/// | `Idle`        | → `WakePending`             | → `Sleeping`, blocks              |
/// | `WakePending` | unchanged (coalesced)       | → `Idle`, returns immediately     |
/// | `Sleeping`    | → `WakePending`, notify     | not allowed (single sleeper)      |
///
/// A blocked sleeper leaves `Sleeping` only when a wake moves the gate to `WakePending`; it then
/// consumes that wake and returns with the gate `Idle`.
#[derive(Debug)]
pub struct SleepGate {
    state: Mutex<GateState>,
    cond: Condvar,
    wakes: AtomicU64,
}

impl SleepGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::Idle),
            cond: Condvar::new(),
            wakes: AtomicU64::new(0),
        }
    }

    /// Delivers a wake. Safe to call from any thread, any number of times.
    pub fn wake(&self) {
        self.wakes.fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.state);
        match *state {
            GateState::Idle => *state = GateState::WakePending,
            GateState::WakePending => {}
            GateState::Sleeping => {
                *state = GateState::WakePending;
                self.cond.notify_one();
            }
        }
    }

    /// Blocks the calling thread until a wake is available, then consumes it.
    ///
    /// Only the thread that owns this gate may call `sleep`.
    pub fn sleep(&self) {
        let mut state = lock(&self.state);
        debug_assert_ne!(*state, GateState::Sleeping, "SleepGate has a single sleeper");
        if *state == GateState::WakePending {
            *state = GateState::Idle;
            return;
        }

        *state = GateState::Sleeping;
        while *state == GateState::Sleeping {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *state = GateState::Idle;
    }

    pub fn state(&self) -> GateState {
        *lock(&self.state)
    }

    /// Total number of `wake()` calls observed, including coalesced ones.
    pub fn wake_count(&self) -> u64 {
        self.wakes.load(Ordering::Relaxed)
    }
}

impl Default for SleepGate {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(all(test, feature = "loom"))]
mod loom_tests {
    use super::*;

    use loom::sync::Arc;
    use loom::thread;

    #[test]
    fn wake_is_never_lost() {
        loom::model(|| {
            let gate = Arc::new(SleepGate::new());
            let waker = gate.clone();
            let handle = thread::spawn(move || waker.wake());
            gate.sleep();
            handle.join().unwrap();
            assert_eq!(gate.state(), GateState::Idle);
        });
    }

    #[test]
    fn two_producers_one_sleep() {
        loom::model(|| {
            let gate = Arc::new(SleepGate::new());
            let a = gate.clone();
            let b = gate.clone();
            let ha = thread::spawn(move || a.wake());
            let hb = thread::spawn(move || b.wake());
            gate.sleep();
            ha.join().unwrap();
            hb.join().unwrap();
            assert_ne!(gate.state(), GateState::Sleeping);
        });
    }
}
