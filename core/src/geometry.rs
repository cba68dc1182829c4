//! Device geometry constants and linear-address arithmetic
//! Fixed at compile time; every other module treats them as pure parameters.

use serde::{Deserialize, Serialize};

/// Number of erase blocks in the device.
pub const NUM_BLOCKS: usize = 256;
/// Number of pages per block.
pub const NUM_PAGES: usize = 256;
/// Number of bytes per page.
pub const NUM_BYTES: usize = 256;

/// Bytes in one page, the smallest programmable unit.
pub const PAGE_SIZE: usize = NUM_BYTES;
/// Bytes in one block, the smallest erasable unit.
pub const BLOCK_SIZE: usize = NUM_PAGES * NUM_BYTES;
/// Total bytes of storage in the device.
pub const DEVICE_SIZE: usize = NUM_BLOCKS * BLOCK_SIZE;

/// Wrap a linear offset so it lands inside device storage.
///
/// Running off the end of storage is defined behavior, not an error: the
/// access continues from the beginning.
pub fn wrap(offset: usize) -> usize {
    offset % DEVICE_SIZE
}

/// Block number containing the (unwrapped) linear offset.
pub fn block_of(offset: usize) -> usize {
    wrap(offset) / BLOCK_SIZE
}

/// Page number, within its block, containing the linear offset.
pub fn page_of(offset: usize) -> usize {
    (offset % BLOCK_SIZE) / PAGE_SIZE
}

/// Byte number, within its page, of the linear offset.
pub fn byte_of(offset: usize) -> usize {
    offset % PAGE_SIZE
}

/// Offset of the first byte of the page containing `offset`.
pub fn page_start(offset: usize) -> usize {
    (offset / PAGE_SIZE) * PAGE_SIZE
}

/// Offset of the last byte of the page containing `offset`.
pub fn page_end(offset: usize) -> usize {
    page_start(offset) + PAGE_SIZE - 1
}

/// Offset of the first byte of the block containing `offset`.
pub fn block_start(offset: usize) -> usize {
    (offset / BLOCK_SIZE) * BLOCK_SIZE
}

/// Offset of the last byte of the block containing `offset`.
pub fn block_end(offset: usize) -> usize {
    block_start(offset) + BLOCK_SIZE - 1
}

/// Storage chip geometry as reported through the device information base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipGeometry {
    pub nblocks: u32,
    pub npages_per_block: u32,
    pub nbytes_per_page: u32,
}

impl ChipGeometry {
    /// Geometry of the emulated device.
    pub fn device() -> Self {
        Self {
            nblocks: NUM_BLOCKS as u32,
            npages_per_block: NUM_PAGES as u32,
            nbytes_per_page: NUM_BYTES as u32,
        }
    }

    pub fn page_size(&self) -> u32 {
        self.nbytes_per_page
    }

    pub fn block_size(&self) -> u32 {
        self.npages_per_block * self.nbytes_per_page
    }

    pub fn device_size(&self) -> u32 {
        self.nblocks * self.block_size()
    }
}
