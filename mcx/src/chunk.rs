//! Per-chunk header codec.
//!
//! Every payload returned by a context is immediately preceded by one
//! 64-bit word packing three fields:
//!
//! ```text
//!  63    62........33  32.........3  2...0
//!  spare  block offset  value         tag
//! ```
//!
//! - `tag`: the 3-bit [`ContextKind`] identity, used to dispatch
//!   framework-level operations on a raw pointer.
//! - `value`: implementation-defined, at most [`MAX_CHUNK_VALUE`]; the slab
//!   context stores the aligned chunk size here, which is what bounds the
//!   chunk sizes a context can serve.
//! - `block offset`: distance in bytes from the owning block's start to the
//!   chunk, at most [`MAX_BLOCK_OFFSET`]; recovering the block from a payload
//!   pointer is a single subtraction.

use std::mem;
use std::ptr::NonNull;

use crate::context::ContextKind;
use crate::MAX_ALIGN;

/// Size in bytes of the header word preceding every payload.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<u64>();

const TAG_BITS: u32 = 3;
const VALUE_BITS: u32 = 30;
const OFFSET_BITS: u32 = 30;

const VALUE_SHIFT: u32 = TAG_BITS;
const OFFSET_SHIFT: u32 = TAG_BITS + VALUE_BITS;

const TAG_MASK: u64 = (1 << TAG_BITS) - 1;
const VALUE_MASK: u64 = (1 << VALUE_BITS) - 1;
const OFFSET_MASK: u64 = (1 << OFFSET_BITS) - 1;

/// Largest value storable in the header's value field.
pub const MAX_CHUNK_VALUE: usize = VALUE_MASK as usize;

/// Largest chunk-to-block distance storable in the header.
pub const MAX_BLOCK_OFFSET: usize = OFFSET_MASK as usize;

// The header must not disturb payload alignment.
const _: () = assert!(CHUNK_HEADER_SIZE % MAX_ALIGN == 0);

/// A decoded chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader(u64);

impl ChunkHeader {
    /// Packs a header word.
    ///
    /// `block_offset` is the byte distance from the owning block's start to
    /// the chunk (header word) itself.
    #[inline]
    pub fn new(kind: ContextKind, block_offset: usize, value: usize) -> Self {
        debug_assert!(block_offset <= MAX_BLOCK_OFFSET);
        debug_assert!(value <= MAX_CHUNK_VALUE);
        ChunkHeader(
            kind.tag() as u64
                | ((value as u64 & VALUE_MASK) << VALUE_SHIFT)
                | ((block_offset as u64 & OFFSET_MASK) << OFFSET_SHIFT),
        )
    }

    /// Raw 3-bit identity tag.
    #[inline]
    pub fn tag(self) -> u8 {
        (self.0 & TAG_MASK) as u8
    }

    /// The context kind this chunk belongs to, if the tag is known.
    #[inline]
    pub fn kind(self) -> Option<ContextKind> {
        ContextKind::from_tag(self.tag())
    }

    /// Implementation-defined value field.
    #[inline]
    pub fn value(self) -> usize {
        ((self.0 >> VALUE_SHIFT) & VALUE_MASK) as usize
    }

    /// Byte distance from the owning block's start to this chunk.
    #[inline]
    pub fn block_offset(self) -> usize {
        ((self.0 >> OFFSET_SHIFT) & OFFSET_MASK) as usize
    }
}

/// Writes a header word at `chunk` (the header base, not the payload).
///
/// # Safety
///
/// `chunk` must point at [`CHUNK_HEADER_SIZE`] writable, `MAX_ALIGN`-aligned
/// bytes.
#[inline]
pub unsafe fn write_header(chunk: NonNull<u8>, header: ChunkHeader) {
    unsafe { chunk.as_ptr().cast::<u64>().write(header.0) }
}

/// Reads the header word at `chunk`.
///
/// # Safety
///
/// `chunk` must point at a previously written header word.
#[inline]
pub unsafe fn read_header(chunk: NonNull<u8>) -> ChunkHeader {
    ChunkHeader(unsafe { chunk.as_ptr().cast::<u64>().read() })
}

/// The payload served from the chunk at `chunk`.
///
/// # Safety
///
/// `chunk` must point at a chunk inside a live block.
#[inline]
pub unsafe fn payload_of(chunk: NonNull<u8>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(chunk.as_ptr().add(CHUNK_HEADER_SIZE)) }
}

/// The chunk (header base) a payload pointer was served from.
///
/// # Safety
///
/// `payload` must have been returned by a context allocation.
#[inline]
pub unsafe fn chunk_of(payload: NonNull<u8>) -> NonNull<u8> {
    unsafe { NonNull::new_unchecked(payload.as_ptr().sub(CHUNK_HEADER_SIZE)) }
}

/// Decodes the header preceding a payload pointer.
///
/// # Safety
///
/// `payload` must have been returned by a context allocation.
#[inline]
pub unsafe fn header_of_payload(payload: NonNull<u8>) -> ChunkHeader {
    unsafe { read_header(chunk_of(payload)) }
}

/// Recovers the owning block's start address from a payload pointer.
///
/// # Safety
///
/// `payload` must have been returned by a context allocation, and the chunk
/// header must still be intact.
#[inline]
pub unsafe fn block_of(payload: NonNull<u8>) -> NonNull<u8> {
    unsafe {
        let chunk = chunk_of(payload);
        let offset = read_header(chunk).block_offset();
        NonNull::new_unchecked(chunk.as_ptr().sub(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_fields() {
        let hdr = ChunkHeader::new(ContextKind::Slab, 4096, 64);
        assert_eq!(hdr.kind(), Some(ContextKind::Slab));
        assert_eq!(hdr.block_offset(), 4096);
        assert_eq!(hdr.value(), 64);
    }

    #[test]
    fn extreme_values_round_trip() {
        let hdr = ChunkHeader::new(ContextKind::Slab, MAX_BLOCK_OFFSET, MAX_CHUNK_VALUE);
        assert_eq!(hdr.block_offset(), MAX_BLOCK_OFFSET);
        assert_eq!(hdr.value(), MAX_CHUNK_VALUE);
        assert_eq!(hdr.kind(), Some(ContextKind::Slab));

        let hdr = ChunkHeader::new(ContextKind::Slab, 0, 0);
        assert_eq!(hdr.block_offset(), 0);
        assert_eq!(hdr.value(), 0);
    }

    #[test]
    fn fields_do_not_bleed() {
        // All-ones in one field must leave the others zero.
        let hdr = ChunkHeader::new(ContextKind::Slab, MAX_BLOCK_OFFSET, 0);
        assert_eq!(hdr.value(), 0);
        let hdr = ChunkHeader::new(ContextKind::Slab, 0, MAX_CHUNK_VALUE);
        assert_eq!(hdr.block_offset(), 0);
    }

    #[test]
    fn header_write_read_through_memory() {
        let mut buf = [0u8; CHUNK_HEADER_SIZE * 2];
        let chunk = NonNull::new(buf.as_mut_ptr()).unwrap();
        let hdr = ChunkHeader::new(ContextKind::Slab, 72, 64);
        unsafe {
            write_header(chunk, hdr);
            assert_eq!(read_header(chunk), hdr);
            let payload = payload_of(chunk);
            assert_eq!(
                payload.as_ptr() as usize - chunk.as_ptr() as usize,
                CHUNK_HEADER_SIZE
            );
            assert_eq!(chunk_of(payload), chunk);
            assert_eq!(header_of_payload(payload), hdr);
        }
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        // Tag 7 is unassigned.
        let raw = ChunkHeader(7);
        assert_eq!(raw.kind(), None);
    }
}
