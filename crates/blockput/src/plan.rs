//! Block and chunk layout of an upload.
//!
//! A source is cut into fixed 4 MiB blocks; each block is sent as one or more
//! chunks whose size is a power-of-two multiple of 256 KiB. Planning is a pure
//! computation with no I/O, so the layout can be derived identically before
//! a first attempt and on every resume.
//!
//! ```rust
//! use blockput::plan::{ChunkPlan, ChunkSize};
//!
//! let plan = ChunkPlan::new(10 * 1024 * 1024, ChunkSize::Mib1).unwrap();
//! assert_eq!(plan.block_count(), 3);
//! assert_eq!(plan.block(2).unwrap().chunk_count(), 2);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fixed size of a server-side block (4 MiB).
pub const BLOCK_SIZE: u32 = 4 * 1024 * 1024;

/// Unit in which chunk sizes are expressed (256 KiB).
pub const CHUNK_UNIT: u32 = 256 * 1024;

/// Supported chunk sizes.
///
/// Serialized as the number of 256 KiB units (1, 2, 4, 8 or 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum ChunkSize {
    /// 256 KiB
    Kib256,
    /// 512 KiB
    Kib512,
    /// 1 MiB
    #[default]
    Mib1,
    /// 2 MiB
    Mib2,
    /// 4 MiB, one chunk per block
    Mib4,
}

impl ChunkSize {
    /// Every supported chunk size, smallest first.
    pub const ALL: [Self; 5] = [
        Self::Kib256,
        Self::Kib512,
        Self::Mib1,
        Self::Mib2,
        Self::Mib4,
    ];

    /// Parse a chunk size from a count of 256 KiB units.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidChunkSize`] for anything other than 1, 2, 4, 8 or 16.
    pub fn from_units(units: u32) -> Result<Self> {
        match units {
            1 => Ok(Self::Kib256),
            2 => Ok(Self::Kib512),
            4 => Ok(Self::Mib1),
            8 => Ok(Self::Mib2),
            16 => Ok(Self::Mib4),
            other => Err(Error::InvalidChunkSize(other)),
        }
    }

    /// Number of 256 KiB units in this chunk size.
    pub const fn units(self) -> u32 {
        match self {
            Self::Kib256 => 1,
            Self::Kib512 => 2,
            Self::Mib1 => 4,
            Self::Mib2 => 8,
            Self::Mib4 => 16,
        }
    }

    /// Chunk size in bytes.
    pub const fn bytes(self) -> u32 {
        self.units() * CHUNK_UNIT
    }
}

impl TryFrom<u32> for ChunkSize {
    type Error = Error;

    fn try_from(units: u32) -> Result<Self> {
        Self::from_units(units)
    }
}

impl From<ChunkSize> for u32 {
    fn from(size: ChunkSize) -> Self {
        size.units()
    }
}

/// Layout of one upload: how many blocks, and how each block is chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    total_size: u64,
    block_size: u32,
    chunk_size: u32,
    block_count: u32,
}

impl ChunkPlan {
    /// Plan an upload of `total_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the source needs more blocks than fit in a `u32`.
    pub fn new(total_size: u64, chunk_size: ChunkSize) -> Result<Self> {
        let block_size = BLOCK_SIZE;
        let block_count = u32::try_from(total_size.div_ceil(u64::from(block_size))).map_err(|_| {
            Error::InvalidConfig {
                key: "total_size".to_string(),
                reason: format!("{total_size} bytes exceeds the maximum block count"),
            }
        })?;

        debug_assert_eq!(block_size % chunk_size.bytes(), 0);

        Ok(Self {
            total_size,
            block_size,
            chunk_size: chunk_size.bytes(),
            block_count,
        })
    }

    /// Total number of bytes in the source.
    pub const fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Nominal block size in bytes.
    pub const fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Nominal chunk size in bytes.
    pub const fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Number of blocks, `ceil(total_size / block_size)`.
    pub const fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Byte offset in the source at which block `index` starts.
    ///
    /// For `index == block_count()` this is the total size.
    pub fn block_offset(&self, index: u32) -> u64 {
        (u64::from(index) * u64::from(self.block_size)).min(self.total_size)
    }

    /// Layout of block `index`, or `None` past the last block.
    pub fn block(&self, index: u32) -> Option<BlockSpan> {
        if index >= self.block_count {
            return None;
        }

        let offset = self.block_offset(index);
        let remaining = self.total_size - offset;
        // remaining < block_size here, so the cast cannot truncate
        #[allow(clippy::cast_possible_truncation)]
        let len = remaining.min(u64::from(self.block_size)) as u32;

        Some(BlockSpan {
            index,
            offset,
            len,
            chunk_size: self.chunk_size,
        })
    }

    /// Iterate over every block in order.
    pub fn blocks(&self) -> impl Iterator<Item = BlockSpan> + '_ {
        (0..self.block_count).filter_map(move |i| self.block(i))
    }
}

/// One block of a [`ChunkPlan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    /// Zero-based block index
    pub index: u32,
    /// Offset of the block's first byte in the source
    pub offset: u64,
    /// Length of this block (short for the final block)
    pub len: u32,
    chunk_size: u32,
}

impl BlockSpan {
    /// Number of chunks this block is sent in.
    pub const fn chunk_count(&self) -> u32 {
        self.len.div_ceil(self.chunk_size)
    }

    /// Iterate over the chunks of this block in send order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpan> {
        let block = *self;
        (0..block.chunk_count()).map(move |i| {
            let offset_in_block = i * block.chunk_size;
            let len = (block.len - offset_in_block).min(block.chunk_size);
            ChunkSpan {
                block_index: block.index,
                index_in_block: i,
                offset_in_block,
                len,
                file_offset: block.offset + u64::from(offset_in_block),
            }
        })
    }
}

/// One chunk of a block: the unit sent in a single wire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Block this chunk belongs to
    pub block_index: u32,
    /// Position of the chunk within its block
    pub index_in_block: u32,
    /// Offset of the chunk within its block
    pub offset_in_block: u32,
    /// Chunk length (short for the final chunk of a block)
    pub len: u32,
    /// Offset of the chunk's first byte in the source
    pub file_offset: u64,
}

impl ChunkSpan {
    /// Whether this chunk opens its block (sent with allocate-block).
    pub const fn is_first(&self) -> bool {
        self.index_in_block == 0
    }

    /// Offset within the block just past this chunk.
    pub const fn end_in_block(&self) -> u32 {
        self.offset_in_block + self.len
    }
}
