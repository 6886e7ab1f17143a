//! Block-level bookkeeping for the slab context.
//!
//! A block is one host region of exactly `block_size` bytes: this header,
//! then `chunks_per_block` equally-spaced chunk slots, then tail padding.
//! Free slots chain through a `u32` index overlaid on their payload bytes;
//! `chunks_per_block` terminates the chain.

use std::mem;
use std::ptr::NonNull;

use mcx::chunk::{self, CHUNK_HEADER_SIZE};
use mcx::list::ListNode;
use mcx::MAX_ALIGN;

use crate::SlabHeader;

/// Size in bytes of the header at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

// Chunk slots start right after the header and must stay max-aligned.
const _: () = assert!(BLOCK_HEADER_SIZE % MAX_ALIGN == 0);

/// Header at the start of every block.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Linkage in the context's bucketed freelist. Must stay the first
    /// field: bucket lists are cast back to `BlockHeader` from the node.
    pub node: ListNode,
    /// Number of free chunks in this block.
    pub nfree: u32,
    /// Slot index of the first free chunk, or `chunks_per_block` when none.
    pub first_free_chunk: u32,
    /// The context this block belongs to.
    pub slab: NonNull<SlabHeader>,
}

impl BlockHeader {
    /// Recovers the block header from its embedded list node.
    ///
    /// # Safety
    ///
    /// `node` must be the `node` field of a live `BlockHeader`.
    #[inline]
    pub unsafe fn from_node(node: NonNull<ListNode>) -> NonNull<BlockHeader> {
        node.cast()
    }

    /// Recovers the owning block from a payload pointer via the chunk
    /// header's back-offset.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by a slab allocation and its chunk
    /// header must be intact.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        unsafe { chunk::block_of(payload).cast() }
    }
}

/// Address of the chunk (header base) in slot `idx`.
///
/// # Safety
///
/// `idx` must be within the block's slot range.
#[inline]
pub(crate) unsafe fn chunk_at(
    block: NonNull<BlockHeader>,
    idx: u32,
    full_chunk_size: usize,
) -> NonNull<u8> {
    unsafe {
        NonNull::new_unchecked(
            block
                .as_ptr()
                .cast::<u8>()
                .add(BLOCK_HEADER_SIZE + idx as usize * full_chunk_size),
        )
    }
}

/// Slot index of a chunk within its block.
///
/// # Safety
///
/// `chunk` must be a slot boundary inside `block`.
#[inline]
pub(crate) unsafe fn chunk_index(
    block: NonNull<BlockHeader>,
    chunk: NonNull<u8>,
    full_chunk_size: usize,
) -> u32 {
    let start = block.as_ptr() as usize + BLOCK_HEADER_SIZE;
    let offset = chunk.as_ptr() as usize - start;
    debug_assert_eq!(offset % full_chunk_size, 0);
    (offset / full_chunk_size) as u32
}

/// Reads the next-free-slot index stored in a free chunk's payload.
///
/// # Safety
///
/// `chunk` must be a free slot whose link was written earlier.
#[inline]
pub(crate) unsafe fn read_free_link(chunk: NonNull<u8>) -> u32 {
    unsafe { chunk.as_ptr().add(CHUNK_HEADER_SIZE).cast::<u32>().read() }
}

/// Overlays the next-free-slot index on a chunk's payload.
///
/// # Safety
///
/// `chunk` must be a slot inside a live block and must not be allocated.
#[inline]
pub(crate) unsafe fn write_free_link(chunk: NonNull<u8>, next: u32) {
    unsafe { chunk.as_ptr().add(CHUNK_HEADER_SIZE).cast::<u32>().write(next) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_compact_and_aligned() {
        // node (2 pointers) + two counters + context pointer
        assert_eq!(BLOCK_HEADER_SIZE % MAX_ALIGN, 0);
        assert!(BLOCK_HEADER_SIZE <= 4 * mem::size_of::<usize>() + 8);
    }

    #[test]
    fn chunk_addressing_round_trips() {
        // A fake block: header space plus four 72-byte slots. u64 storage
        // keeps the region max-aligned.
        let full_chunk_size = 72;
        let mut storage = vec![0u64; (BLOCK_HEADER_SIZE + 4 * full_chunk_size) / 8];
        let block = NonNull::new(storage.as_mut_ptr().cast::<BlockHeader>()).unwrap();

        unsafe {
            for idx in 0..4 {
                let chunk = chunk_at(block, idx, full_chunk_size);
                assert_eq!(chunk_index(block, chunk, full_chunk_size), idx);
            }
            let c0 = chunk_at(block, 0, full_chunk_size);
            let c1 = chunk_at(block, 1, full_chunk_size);
            assert_eq!(
                c1.as_ptr() as usize - c0.as_ptr() as usize,
                full_chunk_size
            );
        }
    }

    #[test]
    fn free_links_round_trip() {
        let full_chunk_size = 72;
        let mut storage = vec![0u64; (BLOCK_HEADER_SIZE + 2 * full_chunk_size) / 8];
        let block = NonNull::new(storage.as_mut_ptr().cast::<BlockHeader>()).unwrap();

        unsafe {
            let chunk = chunk_at(block, 0, full_chunk_size);
            write_free_link(chunk, 17);
            assert_eq!(read_free_link(chunk), 17);
        }
    }
}
