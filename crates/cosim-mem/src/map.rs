//! Kernel-side physical address router.
//!
//! Regions never overlap. An access must fall entirely inside one region; anything else
//! (unmapped, straddling two regions, wrapping the address space) completes with
//! [`Response::AddressError`].

use std::ops::Range;
use std::sync::Arc;

use thiserror::Error;

use crate::dmi::DmiBacking;
use crate::ram::RamStore;
use crate::target::{TargetCtx, Transport};
use crate::txn::{Direction, Response, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    #[error("region 0x{start:x}..0x{end:x} overlaps an existing mapping")]
    Overlap { start: u64, end: u64 },

    #[error("region at 0x{start:x} has zero length or wraps the address space")]
    InvalidRange { start: u64 },
}

/// Memory-mapped device registers, addressed by offset from the mapping base.
pub trait MmioHandler: Send {
    fn read(&mut self, offset: u64, data: &mut [u8], ctx: &mut TargetCtx<'_>) -> Response;
    fn write(&mut self, offset: u64, data: &[u8], ctx: &mut TargetCtx<'_>) -> Response;
}

enum Region {
    Ram(Box<dyn RamStore>),
    Dmi(Arc<DmiBacking>),
    Mmio(Box<dyn MmioHandler>),
}

struct Mapping {
    base: u64,
    /// Fixed length; DMI-backed regions track their backing's current length instead.
    len: u64,
    region: Region,
}

impl Mapping {
    fn range(&self) -> Range<u64> {
        match &self.region {
            Region::Dmi(backing) => backing.range(),
            _ => self.base..self.base + self.len,
        }
    }
}

#[derive(Default)]
pub struct MemoryMap {
    mappings: Vec<Mapping>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, base: u64, len: u64, region: Region) -> Result<(), MapError> {
        let end = base
            .checked_add(len)
            .filter(|_| len > 0)
            .ok_or(MapError::InvalidRange { start: base })?;
        if self
            .mappings
            .iter()
            .any(|m| {
                let r = m.range();
                base < r.end && r.start < end
            })
        {
            return Err(MapError::Overlap { start: base, end });
        }
        self.mappings.push(Mapping { base, len, region });
        self.mappings.sort_by_key(|m| m.base);
        Ok(())
    }

    pub fn map_ram(&mut self, base: u64, store: impl RamStore + 'static) -> Result<(), MapError> {
        let len = store.size();
        self.insert(base, len, Region::Ram(Box::new(store)))
    }

    /// Maps a DMI-capable store at its own base so the bus and the fast path share the bytes.
    pub fn map_dmi(&mut self, backing: Arc<DmiBacking>) -> Result<(), MapError> {
        let base = backing.base();
        let len = backing.len();
        self.insert(base, len, Region::Dmi(backing))
    }

    pub fn map_mmio(
        &mut self,
        base: u64,
        len: u64,
        handler: impl MmioHandler + 'static,
    ) -> Result<(), MapError> {
        self.insert(base, len, Region::Mmio(Box::new(handler)))
    }

    fn lookup(&mut self, start: u64, end: u64) -> Option<&mut Mapping> {
        self.mappings.iter_mut().find(|m| {
            let r = m.range();
            r.start <= start && end <= r.end
        })
    }
}

impl Transport for MemoryMap {
    fn transport(&mut self, txn: &mut Transaction, ctx: &mut TargetCtx<'_>) {
        let address = txn.address;
        let Some(end) = txn.end() else {
            txn.response = Response::AddressError;
            return;
        };
        let Some(mapping) = self.lookup(address, end) else {
            tracing::trace!(address, size = txn.size(), "unmapped access");
            txn.response = Response::AddressError;
            return;
        };

        let offset = address - mapping.base;
        let ok = match (&mut mapping.region, txn.direction) {
            (Region::Ram(ram), Direction::Read) => ram.read_into(offset, &mut txn.data).is_ok(),
            (Region::Ram(ram), Direction::Write) => ram.write_from(offset, &txn.data).is_ok(),
            (Region::Dmi(backing), Direction::Read) => backing.read(address, &mut txn.data).is_ok(),
            (Region::Dmi(backing), Direction::Write) => backing.write(address, &txn.data).is_ok(),
            (Region::Mmio(dev), Direction::Read) => dev.read(offset, &mut txn.data, ctx).is_ok(),
            (Region::Mmio(dev), Direction::Write) => dev.write(offset, &txn.data, ctx).is_ok(),
        };
        txn.response = if ok {
            Response::Ok
        } else {
            Response::AddressError
        };
    }
}
