use std::mem;

use crate::{align::ALIGNMENT, header::Header};

/// Block header size in bytes. This is the `H` that shows up in all the
/// size arithmetic of this crate: a block occupies `BLOCK_HEADER_SIZE +
/// size` contiguous bytes.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Header<Block>>();

// Payload addresses are header address + BLOCK_HEADER_SIZE, so the header
// size must itself be a multiple of the alignment guarantee.
const _: () = assert!(BLOCK_HEADER_SIZE % ALIGNMENT == 0);

/// What a block is currently used for.
///
/// `Free` and `Alloc` blocks live in the break region and are linked into
/// the heap list. `Mapped` blocks own an independent anonymous mapping,
/// carry null links and are never part of the list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// Break-region block available for reuse.
    Free,
    /// Break-region block currently handed out to the caller.
    Alloc,
    /// Stand-alone mapping, released back to the OS on free.
    Mapped,
}

/// Block specific data. The complete header is [`Header<Block>`], which is
/// also a list node. In memory it looks like this:
///
/// ```text
/// +----------------------------+          <----------------------+
/// | pointer to next block      |   <------+                      |
/// +----------------------------+          | Pointer<Node<Block>> |
/// | pointer to prev block      |   <------+                      |
/// +----------------------------+                                 | <Node<Block>>
/// | block size                 |   <------+                      |
/// +----------------------------+          | Block                |
/// | status (+ struct padding)  |   <------+                      |
/// +----------------------------+          <----------------------+
/// |       Block payload        |   <------+
/// |            ...             |          | `size` bytes, returned
/// |            ...             |          | to the caller.
/// |            ...             |   <------+
/// +----------------------------+
/// ```
///
/// The payload of the next block in the list starts exactly
/// `BLOCK_HEADER_SIZE + size` bytes after this header, which is what keeps
/// the break region contiguous and lets neighbors be found with plain
/// address arithmetic.
pub(crate) struct Block {
    /// Usable payload bytes following the header. Excludes
    /// [`BLOCK_HEADER_SIZE`], always a multiple of [`ALIGNMENT`].
    pub size: usize,
    /// Current use of this block.
    pub status: BlockStatus,
}

impl Header<Block> {
    /// Payload size, excluding [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn size(&self) -> usize {
        self.data.size
    }

    /// Total footprint of the block, including [`BLOCK_HEADER_SIZE`].
    #[inline]
    pub fn total_size(&self) -> usize {
        BLOCK_HEADER_SIZE + self.data.size
    }

    /// Current status of this block.
    #[inline]
    pub fn status(&self) -> BlockStatus {
        self.data.status
    }

    /// Whether the block can be handed out again.
    #[inline]
    pub fn is_free(&self) -> bool {
        self.data.status == BlockStatus::Free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn header_size_is_packed() {
        // Two links, a size and a padded status byte.
        assert_eq!(BLOCK_HEADER_SIZE, 32);
    }
}
