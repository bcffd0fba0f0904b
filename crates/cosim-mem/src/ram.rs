use thiserror::Error;

/// Errors returned by RAM stores and DMI backings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// The requested range falls outside the store.
    #[error("memory access out of range: offset=0x{offset:x} len={len} size=0x{size:x}")]
    OutOfRange { offset: u64, len: usize, size: u64 },

    #[error("memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },

    #[error("invalid memory chunk size {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Byte-addressable RAM, addressed by offset from the start of the store.
pub trait RamStore: Send {
    fn size(&self) -> u64;

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> MemoryResult<()>;

    fn write_from(&mut self, offset: u64, src: &[u8]) -> MemoryResult<()>;

    fn read_u32_le(&self, offset: u64) -> MemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32_le(&mut self, offset: u64, value: u32) -> MemoryResult<()> {
        self.write_from(offset, &value.to_le_bytes())
    }
}

pub(crate) fn check_range(size: u64, offset: u64, len: usize) -> MemoryResult<(usize, usize)> {
    let err = MemoryError::OutOfRange { offset, len, size };
    let end = offset.checked_add(len as u64).ok_or(err.clone())?;
    if end > size {
        return Err(err);
    }
    let start = usize::try_from(offset).map_err(|_| err.clone())?;
    let end = usize::try_from(end).map_err(|_| err)?;
    Ok((start, end))
}

/// Contiguous RAM, allocated up front.
#[derive(Debug, Clone)]
pub struct DenseRam {
    data: Box<[u8]>,
}

impl DenseRam {
    pub fn new(size: u64) -> MemoryResult<Self> {
        let size_usize = usize::try_from(size).map_err(|_| MemoryError::SizeTooLarge { size })?;
        Ok(Self {
            data: vec![0u8; size_usize].into_boxed_slice(),
        })
    }
}

impl RamStore for DenseRam {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> MemoryResult<()> {
        let (start, end) = check_range(self.size(), offset, dst.len())?;
        dst.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_from(&mut self, offset: u64, src: &[u8]) -> MemoryResult<()> {
        let (start, end) = check_range(self.size(), offset, src.len())?;
        self.data[start..end].copy_from_slice(src);
        Ok(())
    }
}

/// RAM backed by lazily allocated fixed-size chunks. Untouched chunks read as zero.
#[derive(Debug, Clone)]
pub struct SparseRam {
    size: u64,
    chunk_size: usize,
    chunks: Vec<Option<Box<[u8]>>>,
}

impl SparseRam {
    pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

    pub fn new(size: u64) -> MemoryResult<Self> {
        Self::with_chunk_size(size, Self::DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(size: u64, chunk_size: usize) -> MemoryResult<Self> {
        if chunk_size == 0 {
            return Err(MemoryError::InvalidChunkSize { chunk_size });
        }
        let chunk_size_u64 = chunk_size as u64;
        let chunk_count = size
            .checked_add(chunk_size_u64 - 1)
            .ok_or(MemoryError::SizeTooLarge { size })?
            / chunk_size_u64;
        let chunk_count =
            usize::try_from(chunk_count).map_err(|_| MemoryError::SizeTooLarge { size })?;
        Ok(Self {
            size,
            chunk_size,
            chunks: vec![None; chunk_count],
        })
    }

    /// Number of chunks that have been materialised by a write.
    pub fn allocated_chunks(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    fn split(&self, offset: u64) -> (usize, usize) {
        let chunk = offset / self.chunk_size as u64;
        let within = offset % self.chunk_size as u64;
        // Both fit: `offset < size` and the chunk vector length is a usize.
        (chunk as usize, within as usize)
    }
}

impl RamStore for SparseRam {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_into(&self, offset: u64, dst: &mut [u8]) -> MemoryResult<()> {
        check_range(self.size, offset, dst.len())?;
        let mut remaining = dst;
        let mut cur = offset;

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.split(cur);
            let take = (self.chunk_size - chunk_off).min(remaining.len());

            match self.chunks.get(chunk_idx).and_then(|c| c.as_ref()) {
                Some(chunk) => remaining[..take].copy_from_slice(&chunk[chunk_off..chunk_off + take]),
                None => remaining[..take].fill(0),
            }

            cur += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }

    fn write_from(&mut self, offset: u64, src: &[u8]) -> MemoryResult<()> {
        check_range(self.size, offset, src.len())?;
        let chunk_size = self.chunk_size;
        let mut remaining = src;
        let mut cur = offset;

        while !remaining.is_empty() {
            let (chunk_idx, chunk_off) = self.split(cur);
            let take = (chunk_size - chunk_off).min(remaining.len());

            let chunk = self.chunks[chunk_idx]
                .get_or_insert_with(|| vec![0u8; chunk_size].into_boxed_slice());
            chunk[chunk_off..chunk_off + take].copy_from_slice(&remaining[..take]);

            cur += take as u64;
            remaining = &remaining[take..];
        }
        Ok(())
    }
}
