use std::ops::Range;

use thiserror::Error;

pub const DEFAULT_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error("declared chunk count {declared} does not match {expected} for the declared size")]
    ChunkCountMismatch { declared: u64, expected: u64 },
    #[error("chunk index {index} out of range (total chunks {total})")]
    IndexOutOfRange { index: u64, total: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    total_size: u64,
    chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, LayoutError> {
        if chunk_size == 0 {
            return Err(LayoutError::ZeroChunkSize);
        }
        Ok(Self {
            total_size,
            chunk_size,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u64 {
        self.total_size.div_ceil(self.chunk_size)
    }

    pub fn check_declared_chunks(&self, declared: u64) -> Result<(), LayoutError> {
        let expected = self.total_chunks();
        if declared != expected {
            return Err(LayoutError::ChunkCountMismatch { declared, expected });
        }
        Ok(())
    }

    pub fn offset(&self, index: u64) -> Result<u64, LayoutError> {
        self.check_index(index)?;
        Ok(index * self.chunk_size)
    }

    pub fn chunk_len(&self, index: u64) -> Result<u64, LayoutError> {
        let offset = self.offset(index)?;
        Ok(self.chunk_size.min(self.total_size - offset))
    }

    /// Byte range `[offset, offset + len)` covered by `index`.
    pub fn range(&self, index: u64) -> Result<Range<u64>, LayoutError> {
        let start = self.offset(index)?;
        let len = self.chunk_len(index)?;
        Ok(start..start + len)
    }

    fn check_index(&self, index: u64) -> Result<(), LayoutError> {
        let total = self.total_chunks();
        if index >= total {
            return Err(LayoutError::IndexOutOfRange { index, total });
        }
        Ok(())
    }
}
