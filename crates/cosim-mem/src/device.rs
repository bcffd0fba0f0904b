//! Device-resident DMI: direct access to memory that lives behind a register peek/poke backend
//! (for example a PCI BAR on an attached accelerator board).
//!
//! The backend only moves naturally aligned 32-bit words plus single bytes, so transfers must
//! start on a 4-byte boundary; whole words go through `peek_u32`/`poke_u32` and a short tail is
//! moved one byte at a time.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::dmi::DmiAccess;
use crate::txn::{Direction, Response, Transaction};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device transfer at offset 0x{offset:x} is not 4-byte aligned")]
    Unaligned { offset: u64 },

    #[error("device access out of range: offset=0x{offset:x}")]
    OutOfRange { offset: u64 },

    #[error("device backend returned error code {code}")]
    Backend { code: i32 },
}

/// Register-level access to device memory. Offsets are relative to the window base.
pub trait PeekPoke: Send {
    fn peek_u32(&mut self, offset: u64) -> Result<u32, DeviceError>;
    fn poke_u32(&mut self, offset: u64, value: u32) -> Result<(), DeviceError>;
    fn peek_u8(&mut self, offset: u64) -> Result<u8, DeviceError>;
    fn poke_u8(&mut self, offset: u64, value: u8) -> Result<(), DeviceError>;
}

/// CPU-side window onto device memory, guarded by the backend's lock.
#[derive(Clone)]
pub struct DeviceWindow {
    base: u64,
    len: u64,
    bar: Arc<Mutex<dyn PeekPoke>>,
}

impl std::fmt::Debug for DeviceWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceWindow")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

impl DeviceWindow {
    pub fn new(base: u64, len: u64, bar: Arc<Mutex<dyn PeekPoke>>) -> Self {
        Self { base, len, bar }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn covers(&self, txn: &Transaction) -> bool {
        match (txn.address.checked_sub(self.base), txn.end()) {
            (Some(_), Some(end)) => end <= self.base.saturating_add(self.len),
            _ => false,
        }
    }

    /// Performs `txn` directly against the device.
    ///
    /// Backend failures do not abort: they are logged and reported as
    /// [`Response::AddressError`] on the transaction.
    pub fn access(&self, txn: &mut Transaction) -> DmiAccess {
        if !self.covers(txn) {
            return DmiAccess::OutOfWindow;
        }
        let offset = txn.address - self.base;
        let result = {
            let mut bar = crate::lock(&self.bar);
            match txn.direction {
                Direction::Read => read_words(&mut *bar, offset, &mut txn.data),
                Direction::Write => write_words(&mut *bar, offset, &txn.data),
            }
        };
        txn.response = match result {
            Ok(()) => Response::Ok,
            Err(err) => {
                tracing::warn!(
                    address = txn.address,
                    size = txn.size(),
                    "device DMI transfer failed: {err}"
                );
                Response::AddressError
            }
        };
        DmiAccess::Hit
    }
}

fn read_words(bar: &mut dyn PeekPoke, offset: u64, dst: &mut [u8]) -> Result<(), DeviceError> {
    if offset % 4 != 0 {
        return Err(DeviceError::Unaligned { offset });
    }
    let mut words = dst.chunks_exact_mut(4);
    let mut cur = offset;
    for word in &mut words {
        word.copy_from_slice(&bar.peek_u32(cur)?.to_le_bytes());
        cur += 4;
    }
    for byte in words.into_remainder() {
        *byte = bar.peek_u8(cur)?;
        cur += 1;
    }
    Ok(())
}

fn write_words(bar: &mut dyn PeekPoke, offset: u64, src: &[u8]) -> Result<(), DeviceError> {
    if offset % 4 != 0 {
        return Err(DeviceError::Unaligned { offset });
    }
    let words = src.chunks_exact(4);
    let tail = words.remainder();
    let mut cur = offset;
    for word in words {
        bar.poke_u32(cur, u32::from_le_bytes([word[0], word[1], word[2], word[3]]))?;
        cur += 4;
    }
    for &byte in tail {
        bar.poke_u8(cur, byte)?;
        cur += 1;
    }
    Ok(())
}

/// In-memory register file implementing [`PeekPoke`], for hosts without attached hardware.
#[derive(Debug, Clone)]
pub struct ScratchBar {
    words: Vec<u32>,
}

impl ScratchBar {
    pub fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(4) as usize],
        }
    }

    fn word_index(&self, offset: u64) -> Result<usize, DeviceError> {
        let index = usize::try_from(offset / 4).map_err(|_| DeviceError::OutOfRange { offset })?;
        if index >= self.words.len() {
            return Err(DeviceError::OutOfRange { offset });
        }
        Ok(index)
    }
}

impl PeekPoke for ScratchBar {
    fn peek_u32(&mut self, offset: u64) -> Result<u32, DeviceError> {
        if offset % 4 != 0 {
            return Err(DeviceError::Unaligned { offset });
        }
        Ok(self.words[self.word_index(offset)?])
    }

    fn poke_u32(&mut self, offset: u64, value: u32) -> Result<(), DeviceError> {
        if offset % 4 != 0 {
            return Err(DeviceError::Unaligned { offset });
        }
        let index = self.word_index(offset)?;
        self.words[index] = value;
        Ok(())
    }

    fn peek_u8(&mut self, offset: u64) -> Result<u8, DeviceError> {
        let word = self.words[self.word_index(offset)?];
        Ok((word >> ((offset % 4) * 8)) as u8)
    }

    fn poke_u8(&mut self, offset: u64, value: u8) -> Result<(), DeviceError> {
        let index = self.word_index(offset)?;
        let shift = (offset % 4) * 8;
        let word = &mut self.words[index];
        *word = (*word & !(0xFF << shift)) | (u32::from(value) << shift);
        Ok(())
    }
}
