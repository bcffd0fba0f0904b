/// Direction of a bus transaction, from the initiator's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Completion status of a [`Transaction`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Response {
    /// Not yet executed by a target.
    #[default]
    Incomplete,
    Ok,
    /// The address (or part of the accessed range) is not backed by any target.
    AddressError,
}

impl Response {
    pub fn is_ok(self) -> bool {
        self == Response::Ok
    }
}

/// A single memory transaction.
///
/// `data` doubles as the payload buffer: for writes it carries the bytes to store, for reads the
/// target fills it in place. The transaction size is always `data.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub address: u64,
    pub direction: Direction,
    pub data: Vec<u8>,
    pub response: Response,
}

impl Transaction {
    /// A read of `size` bytes; the data buffer starts zeroed.
    pub fn read(address: u64, size: u32) -> Self {
        Self {
            address,
            direction: Direction::Read,
            data: vec![0u8; size as usize],
            response: Response::Incomplete,
        }
    }

    pub fn write(address: u64, data: impl Into<Vec<u8>>) -> Self {
        Self {
            address,
            direction: Direction::Write,
            data: data.into(),
            response: Response::Incomplete,
        }
    }

    pub fn write_u32(address: u64, value: u32) -> Self {
        Self::write(address, value.to_le_bytes().to_vec())
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// One past the last byte touched, or `None` if the range wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.address.checked_add(self.data.len() as u64)
    }

    pub fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    /// Interprets up to the first 8 data bytes as a little-endian integer.
    pub fn value_le(&self) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.data.len().min(8);
        buf[..n].copy_from_slice(&self.data[..n]);
        u64::from_le_bytes(buf)
    }
}
