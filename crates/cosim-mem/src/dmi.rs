//! Host-memory DMI: a backing store shared by the kernel-side bus and a CPU-side direct view.
//!
//! [`DmiBacking`] owns the bytes and the guard lock. The kernel thread reaches it through the
//! memory map like any other RAM; the CPU thread reaches it through a [`DmiView`], which holds
//! only a weak reference plus the generation it last resolved.
//!
//! Every access takes the guard lock, then checks that the backing is still alive and not
//! revoked and that the access fits the current length. Relocation, revocation and flushed
//! invalidations bump the generation under the same lock; the view only counts the changes it
//! observes (see [`DmiView::refreshes`]).

use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::ram::{check_range, MemoryResult};
use crate::txn::{Direction, Response, Transaction};

const UNRESOLVED: u64 = u64::MAX;

/// Outcome of a fast-path access attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmiAccess {
    /// The access was performed directly; `txn.response` is set.
    Hit,
    /// The access is not covered by the window; route it through the mailbox instead.
    OutOfWindow,
    /// The backing store is gone or its owner revoked direct access; route it through the
    /// mailbox instead.
    Revoked,
}

#[derive(Debug)]
pub struct DmiBacking {
    base: u64,
    bytes: Mutex<Box<[u8]>>,
    generation: AtomicU64,
    /// Written only while holding `bytes`.
    revoked: AtomicBool,
}

impl DmiBacking {
    pub fn new(base: u64, len: usize) -> Arc<Self> {
        Arc::new(Self {
            base,
            bytes: Mutex::new(vec![0u8; len].into_boxed_slice()),
            generation: AtomicU64::new(0),
            revoked: AtomicBool::new(false),
        })
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        crate::lock(&self.bytes).len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current address range covered by the store.
    pub fn range(&self) -> Range<u64> {
        self.base..self.base.saturating_add(self.len())
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Kernel-side read at absolute address `addr`.
    pub fn read(&self, addr: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let bytes = crate::lock(&self.bytes);
        let offset = addr.wrapping_sub(self.base);
        let (start, end) = check_range(bytes.len() as u64, offset, dst.len())?;
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    /// Kernel-side write at absolute address `addr`.
    pub fn write(&self, addr: u64, src: &[u8]) -> MemoryResult<()> {
        let mut bytes = crate::lock(&self.bytes);
        let offset = addr.wrapping_sub(self.base);
        let (start, end) = check_range(bytes.len() as u64, offset, src.len())?;
        bytes[start..end].copy_from_slice(src);
        Ok(())
    }

    /// Moves the store to a fresh allocation of `new_len` bytes, keeping the common prefix.
    ///
    /// Holds the guard lock for the whole move, so no direct copy can observe the old buffer
    /// after the generation has changed.
    pub fn relocate(&self, new_len: usize) {
        let mut bytes = crate::lock(&self.bytes);
        let mut moved = vec![0u8; new_len].into_boxed_slice();
        let keep = bytes.len().min(new_len);
        moved[..keep].copy_from_slice(&bytes[..keep]);
        *bytes = moved;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(base = self.base, new_len, generation, "DMI backing relocated");
    }

    /// Withdraws direct access, e.g. while the owner unmaps the storage. Views answer
    /// [`DmiAccess::Revoked`] until [`DmiBacking::reestablish`] is called. Kernel-side reads and
    /// writes are unaffected.
    pub fn revoke(&self) {
        let _bytes = crate::lock(&self.bytes);
        if !self.revoked.swap(true, Ordering::AcqRel) {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(base = self.base, generation, "DMI access revoked");
        }
    }

    /// Grants direct access again after [`DmiBacking::revoke`].
    pub fn reestablish(&self) {
        let _bytes = crate::lock(&self.bytes);
        if self.revoked.swap(false, Ordering::AcqRel) {
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::debug!(base = self.base, generation, "DMI access re-established");
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// Applies a flushed invalidation. Returns `true` if `range` overlapped this store.
    pub fn invalidate(&self, range: Range<u64>) -> bool {
        let bytes = crate::lock(&self.bytes);
        let end = self.base.saturating_add(bytes.len() as u64);
        if range.start >= end || range.end <= self.base {
            return false;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(
            start = range.start,
            end = range.end,
            generation,
            "DMI backing invalidated"
        );
        true
    }

    /// Hands out a lazily-resolved CPU-side view of this store.
    pub fn view(self: &Arc<Self>) -> DmiView {
        DmiView {
            backing: Arc::downgrade(self),
            base: self.base,
            resolved: AtomicU64::new(UNRESOLVED),
            refreshes: AtomicU64::new(0),
        }
    }
}

/// Weak, revocable CPU-side view of a [`DmiBacking`].
#[derive(Debug)]
pub struct DmiView {
    backing: Weak<DmiBacking>,
    base: u64,
    resolved: AtomicU64,
    refreshes: AtomicU64,
}

impl DmiView {
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Whether the view has been resolved against its backing at least once.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Relaxed) != UNRESOLVED
    }

    /// Number of generation changes this view has observed.
    pub fn refreshes(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Attempts the transaction directly against the backing store.
    pub fn access(&self, txn: &mut Transaction) -> DmiAccess {
        if txn.address < self.base {
            return DmiAccess::OutOfWindow;
        }
        let Some(backing) = self.backing.upgrade() else {
            return DmiAccess::Revoked;
        };

        let mut bytes = crate::lock(&backing.bytes);
        if backing.revoked.load(Ordering::Acquire) {
            return DmiAccess::Revoked;
        }
        let generation = backing.generation.load(Ordering::Acquire);
        let cached = self.resolved.swap(generation, Ordering::Relaxed);
        if cached == UNRESOLVED {
            tracing::trace!(base = self.base, generation, "DMI view resolved");
        } else if cached != generation {
            self.refreshes.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                base = self.base,
                from = cached,
                to = generation,
                "DMI view observed a new generation"
            );
        }

        let offset = txn.address - self.base;
        let Ok((start, end)) = check_range(bytes.len() as u64, offset, txn.data.len()) else {
            return DmiAccess::OutOfWindow;
        };
        match txn.direction {
            Direction::Read => txn.data.copy_from_slice(&bytes[start..end]),
            Direction::Write => bytes[start..end].copy_from_slice(&txn.data),
        }
        txn.response = Response::Ok;
        DmiAccess::Hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_write_is_visible_to_kernel_side_reads() {
        let backing = DmiBacking::new(0x8000_0000, 0x100);
        let view = backing.view();
        assert!(!view.is_resolved());

        let mut txn = Transaction::write_u32(0x8000_0010, 0xAABB_CCDD);
        assert_eq!(view.access(&mut txn), DmiAccess::Hit);
        assert_eq!(txn.response, Response::Ok);
        assert!(view.is_resolved());

        let mut buf = [0u8; 4];
        backing.read(0x8000_0010, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0xAABB_CCDD);
    }

    #[test]
    fn accesses_outside_the_window_fall_through() {
        let backing = DmiBacking::new(0x1000, 0x10);
        let view = backing.view();

        assert_eq!(
            view.access(&mut Transaction::read(0xFFF, 1)),
            DmiAccess::OutOfWindow
        );
        assert_eq!(
            view.access(&mut Transaction::read(0x100E, 4)),
            DmiAccess::OutOfWindow
        );
    }

    #[test]
    fn relocation_is_picked_up_by_the_next_access() {
        let backing = DmiBacking::new(0, 8);
        let view = backing.view();
        backing.write(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(view.access(&mut Transaction::read(4, 4)), DmiAccess::Hit);

        backing.relocate(32);
        let mut txn = Transaction::read(4, 4);
        assert_eq!(view.access(&mut txn), DmiAccess::Hit);
        assert_eq!(txn.data, vec![1, 2, 3, 4]);
        assert_eq!(view.refreshes(), 1);

        // The grown region is reachable without re-creating the view.
        assert_eq!(
            view.access(&mut Transaction::write_u32(28, 7)),
            DmiAccess::Hit
        );
    }

    #[test]
    fn invalidation_bumps_generation_only_when_overlapping() {
        let backing = DmiBacking::new(0x1000, 0x100);
        assert!(!backing.invalidate(0..0x1000));
        assert_eq!(backing.generation(), 0);
        assert!(backing.invalidate(0x10F0..0x2000));
        assert_eq!(backing.generation(), 1);
    }

    #[test]
    fn revoked_backing_refuses_direct_access_until_reestablished() {
        let backing = DmiBacking::new(0x1000, 0x10);
        let view = backing.view();
        assert_eq!(view.access(&mut Transaction::write_u32(0x1000, 5)), DmiAccess::Hit);

        backing.revoke();
        backing.revoke();
        assert!(backing.is_revoked());
        assert_eq!(backing.generation(), 1);
        let mut txn = Transaction::write_u32(0x1000, 6);
        assert_eq!(view.access(&mut txn), DmiAccess::Revoked);
        assert_eq!(txn.response, Response::Incomplete);

        // The owner still reaches the bytes.
        let mut buf = [0u8; 4];
        backing.read(0x1000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 5);

        backing.reestablish();
        assert_eq!(backing.generation(), 2);
        let mut txn = Transaction::read(0x1000, 4);
        assert_eq!(view.access(&mut txn), DmiAccess::Hit);
        assert_eq!(txn.value_le(), 5);
    }

    #[test]
    fn dropped_backing_revokes_the_view() {
        let backing = DmiBacking::new(0, 16);
        let view = backing.view();
        drop(backing);
        assert_eq!(view.access(&mut Transaction::read(0, 4)), DmiAccess::Revoked);
    }
}
