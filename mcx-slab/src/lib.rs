//! # mcx-slab
//!
//! A slab memory context for large populations of equally-sized chunks.
//!
//! The constant chunk size allows significant simplification over general
//! purpose allocators: blocks are carved into chunks of exactly the right
//! size (plus alignment), and free-chunk bookkeeping lives both at the block
//! level and at the context level.
//!
//! ## Design
//!
//! Within each block, free chunks form a singly-linked chain: a free chunk's
//! payload bytes hold the index of the next free chunk, and the block header
//! tracks the chain head plus a free count. This makes alloc and free within
//! a block a push/pop, and makes a fully drained block trivially detectable.
//!
//! At the context level, blocks are bucketed by their number of free chunks:
//! `freelist[k]` links every block with exactly `k` free chunks. Allocation
//! always serves the *fullest* block that still has capacity, so the less
//! full ones drain to empty and are returned to the host the instant their
//! last chunk is freed. The `min_free_chunks` cursor caches the index of the
//! least-free non-empty bucket, which turns the block lookup into a
//! constant-time head access; `0` doubles as "no block has free capacity",
//! which is unambiguous because completely full blocks (bucket 0) are never
//! allocation candidates.
//!
//! ## Example
//!
//! ```
//! use mcx_slab::SlabContext;
//!
//! let mut cx = SlabContext::create("events", 8192, 64).unwrap();
//! let p = cx.alloc(64).unwrap();
//! // ... use the 64-byte payload ...
//! unsafe { SlabContext::free(p) };
//! ```
//!
//! A context serves exactly one size: requests for any other size fail.
//! Contexts are not thread safe; distinct contexts may be used from distinct
//! threads.

#![warn(missing_docs)]

use std::mem;
use std::ptr::{self, NonNull};

use log::trace;
#[cfg(feature = "memory-checking")]
use log::warn;

use mcx::chunk::{self, ChunkHeader, CHUNK_HEADER_SIZE};
use mcx::context::{self, ContextHeader, ContextKind, ContextRef, MethodTable};
use mcx::error::Error;
use mcx::list::{ListHead, ListNode};
#[cfg(any(feature = "memory-checking", feature = "clobber-freed", feature = "randomize-allocated"))]
use mcx::memdebug;
use mcx::stats::Counters;
use mcx::{align_up, sys, MAX_ALIGN};

mod block;

use block::BlockHeader;
pub use block::BLOCK_HEADER_SIZE;

// =============================================================================
// Context record
// =============================================================================

/// The slab context record.
///
/// Lives in a single host allocation of `header_size` bytes: this struct,
/// then `chunks_per_block + 1` freelist heads, then (under memory checking)
/// a scratch bitmap of `chunks_per_block` bytes used by the consistency
/// check.
#[repr(C)]
pub(crate) struct SlabHeader {
    /// Framework part. Must stay the first field: the framework dispatches
    /// on `NonNull<ContextHeader>` and casts back.
    header: ContextHeader,
    /// Chunk size served to callers.
    chunk_size: usize,
    /// Chunk size including header and alignment.
    full_chunk_size: usize,
    /// Size of each block obtained from the host.
    block_size: usize,
    /// Allocated size of this context record.
    header_size: usize,
    /// Number of chunks carved from one block.
    chunks_per_block: u32,
    /// Index of the least-free non-empty bucket, or 0 when no block has
    /// free capacity.
    min_free_chunks: u32,
    /// Number of live blocks.
    nblocks: u32,
}

impl SlabHeader {
    /// Pointer to the freelist head for blocks with `i` free chunks.
    ///
    /// # Safety
    ///
    /// `slab` must point at a live slab record and `i <= chunks_per_block`.
    #[inline]
    unsafe fn freelist_ptr(slab: NonNull<SlabHeader>, i: u32) -> *mut ListHead {
        unsafe {
            slab.as_ptr()
                .cast::<u8>()
                .add(mem::size_of::<SlabHeader>())
                .cast::<ListHead>()
                .add(i as usize)
        }
    }

    /// Pointer to the scratch bitmap following the freelist-head array.
    ///
    /// # Safety
    ///
    /// `slab` must point at a live slab record with `chunks_per_block` set.
    #[cfg(feature = "memory-checking")]
    #[inline]
    unsafe fn freechunks_ptr(slab: NonNull<SlabHeader>) -> *mut u8 {
        unsafe {
            let heads = (*slab.as_ptr()).chunks_per_block as usize + 1;
            slab.as_ptr()
                .cast::<u8>()
                .add(mem::size_of::<SlabHeader>() + heads * mem::size_of::<ListHead>())
        }
    }
}

// =============================================================================
// Public handle
// =============================================================================

/// An owning handle to a slab context.
///
/// Dropping the handle deletes the context (and any children created under
/// it), releasing every block to the host, so the context cannot leak past
/// the handle's scope. Use [`into_raw`](Self::into_raw) to hand lifetime
/// control to a parent context instead.
///
/// A context is not safe for concurrent use; all operations on one context
/// must be serialized by the caller. Distinct contexts are independent.
pub struct SlabContext {
    raw: NonNull<SlabHeader>,
}

// The handle owns its context outright; moving it across threads is fine as
// long as each context is used from one thread at a time, which the &mut
// methods already enforce.
unsafe impl Send for SlabContext {}

impl SlabContext {
    /// Creates a top-level slab context.
    ///
    /// `chunk_size` is raised to at least the 4-byte freelist link and every
    /// allocation must then request exactly the raised size (see
    /// [`chunk_size`](Self::chunk_size)). `block_size` must fit the block
    /// header plus at least one full chunk.
    ///
    /// # Errors
    ///
    /// [`Error::OutOfMemory`] when the host cannot supply the context
    /// header; invariant-violation errors when the geometry is impossible.
    pub fn create(
        name: &'static str,
        block_size: usize,
        chunk_size: usize,
    ) -> Result<SlabContext, Error> {
        unsafe { Self::create_impl(None, name, block_size, chunk_size) }
    }

    /// Creates a slab context under `parent`.
    ///
    /// Deleting the parent deletes this context too.
    ///
    /// # Safety
    ///
    /// `parent` must refer to a live context, and the returned handle must
    /// be dropped or dismantled with [`into_raw`](Self::into_raw) before the
    /// parent is deleted.
    pub unsafe fn create_under(
        parent: ContextRef,
        name: &'static str,
        block_size: usize,
        chunk_size: usize,
    ) -> Result<SlabContext, Error> {
        unsafe { Self::create_impl(Some(parent), name, block_size, chunk_size) }
    }

    unsafe fn create_impl(
        parent: Option<ContextRef>,
        name: &'static str,
        block_size: usize,
        chunk_size: usize,
    ) -> Result<SlabContext, Error> {
        // A freed chunk stores the next-free slot index in its payload.
        let chunk_size = chunk_size.max(mem::size_of::<u32>());
        let aligned = align_up(chunk_size, MAX_ALIGN);

        if aligned > chunk::MAX_CHUNK_VALUE {
            return Err(Error::ChunkSizeTooLarge {
                chunk_size: aligned,
                max: chunk::MAX_CHUNK_VALUE,
            });
        }
        if block_size > chunk::MAX_BLOCK_OFFSET {
            return Err(Error::BlockSizeTooLarge {
                block_size,
                max: chunk::MAX_BLOCK_OFFSET,
            });
        }

        let full_chunk_size = CHUNK_HEADER_SIZE + aligned;
        if block_size < BLOCK_HEADER_SIZE + full_chunk_size {
            return Err(Error::BlockSizeTooSmall {
                block_size,
                required: BLOCK_HEADER_SIZE + full_chunk_size,
            });
        }
        let chunks_per_block = ((block_size - BLOCK_HEADER_SIZE) / full_chunk_size) as u32;

        // One allocation holds the record, the freelist heads, and (with
        // memory checking) the scratch bitmap.
        let freelist_size = (chunks_per_block as usize + 1) * mem::size_of::<ListHead>();
        #[allow(unused_mut)]
        let mut header_size = mem::size_of::<SlabHeader>() + freelist_size;
        #[cfg(feature = "memory-checking")]
        {
            header_size += chunks_per_block as usize;
        }

        let region = sys::alloc_region(header_size).map_err(|_| Error::OutOfMemory { name })?;
        let slab: NonNull<SlabHeader> = region.cast();
        let s = slab.as_ptr();

        // Nothing below can fail, so a half-created context is never
        // observable by the framework.
        unsafe {
            ptr::addr_of_mut!((*s).chunk_size).write(chunk_size);
            ptr::addr_of_mut!((*s).full_chunk_size).write(full_chunk_size);
            ptr::addr_of_mut!((*s).block_size).write(block_size);
            ptr::addr_of_mut!((*s).header_size).write(header_size);
            ptr::addr_of_mut!((*s).chunks_per_block).write(chunks_per_block);
            ptr::addr_of_mut!((*s).min_free_chunks).write(0);
            ptr::addr_of_mut!((*s).nblocks).write(0);

            for i in 0..=chunks_per_block {
                ptr::write(SlabHeader::freelist_ptr(slab, i), ListHead::new());
            }
            #[cfg(feature = "memory-checking")]
            ptr::write_bytes(SlabHeader::freechunks_ptr(slab), 0, chunks_per_block as usize);

            register_methods();
            ContextHeader::establish(slab.cast(), ContextKind::Slab, parent, name);
        }

        trace!(
            "created slab context \"{name}\": block_size={block_size} chunk_size={chunk_size} \
             chunks_per_block={chunks_per_block}"
        );

        Ok(SlabContext { raw: slab })
    }

    /// Serves one chunk of exactly [`chunk_size`](Self::chunk_size) bytes.
    ///
    /// # Errors
    ///
    /// [`Error::ChunkSizeMismatch`] for any other size;
    /// [`Error::HostAllocFailed`] when a new block was needed and the host
    /// refused it, in which case the context is unchanged.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        unsafe { slab_alloc(self.raw.cast(), size) }
    }

    /// Returns a payload to the slab context that owns it.
    ///
    /// If this empties the owning block, the block is released to the host
    /// immediately.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by a slab allocation and not freed
    /// since, and the owning context must still be live.
    pub unsafe fn free(payload: NonNull<u8>) {
        unsafe { slab_free(payload) }
    }

    /// Pretends to resize a payload.
    ///
    /// The slab serves equally-sized chunks, so the only request that can
    /// succeed is one for the existing chunk size, which returns the same
    /// pointer untouched.
    ///
    /// # Errors
    ///
    /// [`Error::ReallocUnsupported`] for any other size.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free), except the payload stays
    /// allocated.
    pub unsafe fn realloc(payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, Error> {
        unsafe { slab_realloc(payload, size) }
    }

    /// Releases every block, keeping the context usable. Children created
    /// under this context are deleted first. Safe to call on an already
    /// empty context.
    pub fn reset(&mut self) {
        unsafe { context::reset_context(self.context()) }
    }

    /// True if the context holds no blocks.
    pub fn is_empty(&self) -> bool {
        self.nblocks() == 0
    }

    /// Runs the stats pass: traverses every bucket, optionally emitting one
    /// formatted summary line and/or accumulating into `totals`.
    pub fn stats(
        &self,
        emit: Option<&mut dyn FnMut(&ContextHeader, &str, bool)>,
        totals: Option<&mut Counters>,
        to_stderr: bool,
    ) {
        unsafe { slab_stats(self.raw.cast(), emit, totals, to_stderr) }
    }

    /// Verifies the context's internal consistency, reporting every finding
    /// through `log::warn!`.
    #[cfg(feature = "memory-checking")]
    pub fn check(&self) {
        unsafe { slab_check(self.raw.cast()) }
    }

    /// Untyped reference to this context for framework operations.
    pub fn context(&self) -> ContextRef {
        unsafe { ContextRef::from_raw(self.raw.cast()) }
    }

    /// The context's name.
    pub fn name(&self) -> &'static str {
        unsafe { (*self.raw.as_ptr()).header.name() }
    }

    /// The one payload size this context serves. May be larger than the
    /// size passed to [`create`](Self::create): tiny sizes are raised so a
    /// free chunk can hold its freelist link.
    pub fn chunk_size(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).chunk_size }
    }

    /// Total per-chunk footprint: header plus aligned payload.
    pub fn full_chunk_size(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).full_chunk_size }
    }

    /// The configured block size.
    pub fn block_size(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).block_size }
    }

    /// Number of chunks carved from each block.
    pub fn chunks_per_block(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).chunks_per_block as usize }
    }

    /// Number of live blocks.
    pub fn nblocks(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).nblocks as usize }
    }

    /// Bytes currently attributed to this context (always
    /// `nblocks * block_size`).
    pub fn mem_allocated(&self) -> usize {
        unsafe { (*self.raw.as_ptr()).header.mem_allocated() }
    }

    #[cfg(test)]
    fn min_free_chunks(&self) -> u32 {
        unsafe { (*self.raw.as_ptr()).min_free_chunks }
    }

    /// Dismantles the handle without deleting the context, returning the
    /// untyped reference. The context's lifetime is then governed by its
    /// parent (or by an eventual [`from_raw`](Self::from_raw)).
    pub fn into_raw(self) -> ContextRef {
        let cx = self.context();
        mem::forget(self);
        cx
    }

    /// Reassembles a handle from a reference produced by
    /// [`into_raw`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `cx` must refer to a live slab context that no other handle owns.
    pub unsafe fn from_raw(cx: ContextRef) -> SlabContext {
        let raw: NonNull<SlabHeader> = cx.as_raw().cast();
        debug_assert_eq!(unsafe { (*raw.as_ptr()).header.kind() }, ContextKind::Slab);
        SlabContext { raw }
    }
}

impl Drop for SlabContext {
    fn drop(&mut self) {
        unsafe { context::delete_context(self.context()) }
    }
}

impl std::fmt::Debug for SlabContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabContext")
            .field("name", &self.name())
            .field("chunk_size", &self.chunk_size())
            .field("block_size", &self.block_size())
            .field("nblocks", &self.nblocks())
            .finish()
    }
}

// =============================================================================
// Method-table entries
// =============================================================================

static SLAB_METHODS: MethodTable = MethodTable {
    alloc: slab_alloc,
    free: slab_free,
    realloc: slab_realloc,
    reset: slab_reset,
    delete: slab_delete,
    get_chunk_context: slab_chunk_context,
    get_chunk_space: slab_chunk_space,
    is_empty: slab_is_empty,
    stats: slab_stats,
    #[cfg(feature = "memory-checking")]
    check: slab_check,
};

fn register_methods() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| context::register_kind(ContextKind::Slab, &SLAB_METHODS));
}

#[inline]
unsafe fn node_of(block: NonNull<BlockHeader>) -> NonNull<ListNode> {
    unsafe { NonNull::new_unchecked(ptr::addr_of_mut!((*block.as_ptr()).node)) }
}

unsafe fn slab_alloc(cx: NonNull<ContextHeader>, size: usize) -> Result<NonNull<u8>, Error> {
    let slab: NonNull<SlabHeader> = cx.cast();
    let s = slab.as_ptr();

    unsafe {
        let cpb = (*s).chunks_per_block;
        let fcs = (*s).full_chunk_size;

        debug_assert!((*s).min_free_chunks < cpb);

        if size != (*s).chunk_size {
            return Err(Error::ChunkSizeMismatch {
                requested: size,
                expected: (*s).chunk_size,
            });
        }

        // No block has free capacity: carve a fresh one and park it in the
        // all-free bucket, where the pick below will find it.
        if (*s).min_free_chunks == 0 {
            let region = match sys::alloc_region((*s).block_size) {
                Ok(region) => region,
                Err(_) => {
                    return Err(Error::HostAllocFailed {
                        size: (*s).block_size,
                    })
                }
            };
            let block: NonNull<BlockHeader> = region.cast();
            ptr::write(
                block.as_ptr(),
                BlockHeader {
                    node: ListNode::new(),
                    nfree: cpb,
                    first_free_chunk: 0,
                    slab,
                },
            );

            // Chain every slot to its successor; the last slot carries the
            // terminator.
            for idx in 0..cpb {
                let chunk = block::chunk_at(block, idx, fcs);
                block::write_free_link(chunk, idx + 1);
            }

            debug_assert!((*SlabHeader::freelist_ptr(slab, cpb)).is_empty());
            (*SlabHeader::freelist_ptr(slab, cpb)).push_head(node_of(block));
            (*s).min_free_chunks = cpb;
            (*s).nblocks += 1;
            (*s).header.add_allocated((*s).block_size);

            trace!(
                "slab \"{}\": carved new block {:p} ({} chunks)",
                (*s).header.name(),
                block.as_ptr(),
                cpb
            );
        }

        // The cursor names the least-free non-empty bucket; its head block
        // is the fullest one with capacity.
        let bucket = (*s).min_free_chunks;
        let node = (*SlabHeader::freelist_ptr(slab, bucket))
            .first()
            .expect("min_free_chunks bucket is empty");
        let block = BlockHeader::from_node(node);
        let b = block.as_ptr();

        debug_assert_eq!((*b).nfree, bucket);
        debug_assert!((*b).nfree > 0);

        let idx = (*b).first_free_chunk;
        debug_assert!(idx < cpb);
        let chunk = block::chunk_at(block, idx, fcs);

        // Pop the chunk off the in-block chain.
        (*b).nfree -= 1;
        (*b).first_free_chunk = block::read_free_link(chunk);
        (*s).min_free_chunks = (*b).nfree;

        debug_assert!((*b).first_free_chunk <= cpb);
        debug_assert!(
            ((*b).nfree != 0 && (*b).first_free_chunk < cpb)
                || ((*b).nfree == 0 && (*b).first_free_chunk == cpb)
        );

        // The block lost a free chunk: move it one bucket down.
        (*SlabHeader::freelist_ptr(slab, bucket)).unlink(node);
        (*SlabHeader::freelist_ptr(slab, (*b).nfree)).push_head(node);

        // If the block just filled up, find the next candidate bucket.
        if (*s).min_free_chunks == 0 {
            for i in 1..=cpb {
                if !(*SlabHeader::freelist_ptr(slab, i)).is_empty() {
                    (*s).min_free_chunks = i;
                    break;
                }
            }
        }
        if (*s).min_free_chunks == cpb {
            (*s).min_free_chunks = 0;
        }

        chunk::write_header(
            chunk,
            ChunkHeader::new(
                ContextKind::Slab,
                chunk.as_ptr() as usize - block.as_ptr() as usize,
                align_up((*s).chunk_size, MAX_ALIGN),
            ),
        );

        let payload = chunk::payload_of(chunk);

        #[cfg(feature = "memory-checking")]
        if (*s).chunk_size < fcs - CHUNK_HEADER_SIZE {
            memdebug::set_sentinel(payload, (*s).chunk_size);
        }
        #[cfg(feature = "randomize-allocated")]
        memdebug::randomize_region(payload.as_ptr(), size);

        debug_assert_eq!(
            (*s).nblocks as usize * (*s).block_size,
            (*s).header.mem_allocated()
        );

        Ok(payload)
    }
}

unsafe fn slab_free(payload: NonNull<u8>) {
    unsafe {
        let block = BlockHeader::from_payload(payload);
        let b = block.as_ptr();
        let slab = (*b).slab;
        let s = slab.as_ptr();

        let cpb = (*s).chunks_per_block;
        let fcs = (*s).full_chunk_size;
        let chunk = chunk::chunk_of(payload);

        #[cfg(feature = "memory-checking")]
        if (*s).chunk_size < fcs - CHUNK_HEADER_SIZE
            && !memdebug::sentinel_ok(payload, (*s).chunk_size)
        {
            warn!(
                "problem in slab {}: detected write past chunk end in block {:p}, chunk {:p}",
                (*s).header.name(),
                b,
                chunk.as_ptr()
            );
        }

        let idx = block::chunk_index(block, chunk, fcs);

        // Push the slot on the in-block chain.
        block::write_free_link(chunk, (*b).first_free_chunk);
        (*b).first_free_chunk = idx;
        (*b).nfree += 1;

        debug_assert!((*b).nfree <= cpb);

        #[cfg(feature = "clobber-freed")]
        {
            // The first word now holds the freelist link; poison the rest.
            let link = mem::size_of::<u32>();
            if (*s).chunk_size > link {
                memdebug::wipe_region(payload.as_ptr().add(link), (*s).chunk_size - link);
            }
        }

        let old = (*b).nfree - 1;
        (*SlabHeader::freelist_ptr(slab, old)).unlink(node_of(block));

        if (*b).nfree == cpb {
            // The block drained completely. A release only happens out of
            // bucket chunks_per_block - 1, so no candidate can exist in a
            // higher bucket; if this was the cursor's bucket and it is now
            // empty, no block has free capacity at all.
            if (*s).min_free_chunks == old && (*SlabHeader::freelist_ptr(slab, old)).is_empty() {
                (*s).min_free_chunks = 0;
            }

            let block_size = (*s).block_size;
            trace!(
                "slab \"{}\": releasing empty block {:p}",
                (*s).header.name(),
                b
            );
            #[cfg(feature = "clobber-freed")]
            memdebug::wipe_region(block.as_ptr().cast::<u8>(), block_size);
            sys::free_region(block.cast(), block_size);
            (*s).nblocks -= 1;
            (*s).header.sub_allocated(block_size);
        } else {
            let new = (*b).nfree;

            // Keep the cursor exact: it must always name the least-free
            // non-empty bucket. A block leaving bucket 0 becomes the new
            // minimum; a block leaving the cursor's bucket drags the cursor
            // along only when it was the bucket's last member.
            if (*s).min_free_chunks == 0 || new < (*s).min_free_chunks {
                (*s).min_free_chunks = new;
            } else if (*s).min_free_chunks == old
                && (*SlabHeader::freelist_ptr(slab, old)).is_empty()
            {
                (*s).min_free_chunks = new;
            }

            // Head insertion: the most recently touched block is examined
            // first by the next allocation.
            (*SlabHeader::freelist_ptr(slab, new)).push_head(node_of(block));
        }

        debug_assert_eq!(
            (*s).nblocks as usize * (*s).block_size,
            (*s).header.mem_allocated()
        );
    }
}

unsafe fn slab_realloc(payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, Error> {
    unsafe {
        let block = BlockHeader::from_payload(payload);
        let s = (*block.as_ptr()).slab.as_ptr();

        // Equally-sized chunks leave exactly one request we can honor.
        if size == (*s).chunk_size {
            Ok(payload)
        } else {
            Err(Error::ReallocUnsupported {
                chunk_size: (*s).chunk_size,
                requested: size,
            })
        }
    }
}

unsafe fn slab_reset(cx: NonNull<ContextHeader>) {
    let slab: NonNull<SlabHeader> = cx.cast();
    let s = slab.as_ptr();

    #[cfg(feature = "memory-checking")]
    unsafe {
        slab_check(cx);
    }

    unsafe {
        let cpb = (*s).chunks_per_block;
        for i in 0..=cpb {
            let head = SlabHeader::freelist_ptr(slab, i);
            while let Some(node) = (*head).first() {
                (*head).unlink(node);
                let block = BlockHeader::from_node(node);
                #[cfg(feature = "clobber-freed")]
                memdebug::wipe_region(block.as_ptr().cast::<u8>(), (*s).block_size);
                sys::free_region(block.cast(), (*s).block_size);
                (*s).nblocks -= 1;
                (*s).header.sub_allocated((*s).block_size);
            }
        }
        (*s).min_free_chunks = 0;

        debug_assert_eq!((*s).nblocks, 0);
        debug_assert_eq!((*s).header.mem_allocated(), 0);

        trace!("reset slab context \"{}\"", (*s).header.name());
    }
}

unsafe fn slab_delete(cx: NonNull<ContextHeader>) {
    unsafe {
        slab_reset(cx);
        let slab: NonNull<SlabHeader> = cx.cast();
        let header_size = (*slab.as_ptr()).header_size;
        sys::free_region(slab.cast(), header_size);
    }
}

unsafe fn slab_chunk_context(payload: NonNull<u8>) -> NonNull<ContextHeader> {
    unsafe { (*BlockHeader::from_payload(payload).as_ptr()).slab.cast() }
}

unsafe fn slab_chunk_space(payload: NonNull<u8>) -> usize {
    unsafe {
        let slab = (*BlockHeader::from_payload(payload).as_ptr()).slab;
        (*slab.as_ptr()).full_chunk_size
    }
}

unsafe fn slab_is_empty(cx: NonNull<ContextHeader>) -> bool {
    let slab: NonNull<SlabHeader> = cx.cast();
    unsafe { (*slab.as_ptr()).nblocks == 0 }
}

unsafe fn slab_stats(
    cx: NonNull<ContextHeader>,
    emit: Option<&mut dyn FnMut(&ContextHeader, &str, bool)>,
    totals: Option<&mut Counters>,
    to_stderr: bool,
) {
    let slab: NonNull<SlabHeader> = cx.cast();
    let s = slab.as_ptr();

    unsafe {
        let mut nblocks = 0usize;
        let mut freechunks = 0usize;
        let mut totalspace = (*s).header_size;
        let mut freespace = 0usize;

        for i in 0..=(*s).chunks_per_block {
            for node in (*SlabHeader::freelist_ptr(slab, i)).iter() {
                let b = BlockHeader::from_node(node).as_ptr();
                nblocks += 1;
                totalspace += (*s).block_size;
                freespace += (*s).full_chunk_size * (*b).nfree as usize;
                freechunks += (*b).nfree as usize;
            }
        }

        if let Some(emit) = emit {
            let line = format!(
                "{} total in {} blocks; {} free ({} chunks); {} used",
                totalspace,
                nblocks,
                freespace,
                freechunks,
                totalspace - freespace
            );
            emit(&(*s).header, &line, to_stderr);
        }

        if let Some(totals) = totals {
            totals.absorb(&Counters {
                nblocks,
                freechunks,
                totalspace,
                freespace,
            });
        }
    }
}

/// Walks every bucket, every block, and every chunk, logging a warning for
/// each inconsistency. Warnings rather than errors: the reporting path must
/// not re-enter the allocator while its state is suspect.
#[cfg(feature = "memory-checking")]
unsafe fn slab_check(cx: NonNull<ContextHeader>) {
    let slab: NonNull<SlabHeader> = cx.cast();
    let s = slab.as_ptr();

    unsafe {
        let name = (*s).header.name();
        let cpb = (*s).chunks_per_block;
        let fcs = (*s).full_chunk_size;
        let bitmap = SlabHeader::freechunks_ptr(slab);

        for i in 0..=cpb {
            for node in (*SlabHeader::freelist_ptr(slab, i)).iter() {
                let block = BlockHeader::from_node(node);
                let b = block.as_ptr();

                if (*b).nfree != i {
                    warn!(
                        "problem in slab {name}: number of free chunks {} in block {:p} does not \
                         match freelist {i}",
                        (*b).nfree,
                        b
                    );
                }
                if (*b).slab != slab {
                    warn!("problem in slab {name}: bogus slab link in block {:p}", b);
                }

                // The chunk-level freelist lives inside the chunks, so
                // rebuild a bitmap of free slots by walking it.
                ptr::write_bytes(bitmap, 0, cpb as usize);
                let mut nfree = 0u32;
                let mut idx = (*b).first_free_chunk;
                while idx < cpb {
                    if *bitmap.add(idx as usize) != 0 {
                        warn!(
                            "problem in slab {name}: circular free-chunk chain in block {:p}",
                            b
                        );
                        break;
                    }
                    nfree += 1;
                    *bitmap.add(idx as usize) = 1;
                    let chunk = block::chunk_at(block, idx, fcs);
                    idx = block::read_free_link(chunk);
                }

                for j in 0..cpb {
                    if *bitmap.add(j as usize) != 0 {
                        continue;
                    }

                    // Allocated chunk: its header must point back here, and
                    // the sentinel (present whenever alignment left a gap)
                    // must be intact.
                    let chunk = block::chunk_at(block, j, fcs);
                    let header = chunk::read_header(chunk);
                    if chunk.as_ptr().sub(header.block_offset()) != block.as_ptr().cast() {
                        warn!(
                            "problem in slab {name}: bogus block link in block {:p}, chunk {:p}",
                            b,
                            chunk.as_ptr()
                        );
                    }
                    if (*s).chunk_size < fcs - CHUNK_HEADER_SIZE
                        && !memdebug::sentinel_ok(chunk::payload_of(chunk), (*s).chunk_size)
                    {
                        warn!(
                            "problem in slab {name}: detected write past chunk end in block {:p}, \
                             chunk {:p}",
                            b,
                            chunk.as_ptr()
                        );
                    }
                }

                if nfree != (*b).nfree {
                    warn!(
                        "problem in slab {name}: number of free chunks {} in block {:p} does not \
                         match chain length {nfree}",
                        (*b).nfree,
                        b
                    );
                }
            }
        }

        debug_assert_eq!(
            (*s).nblocks as usize * (*s).block_size,
            (*s).header.mem_allocated()
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
