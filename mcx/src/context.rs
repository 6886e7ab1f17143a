//! Context headers, the parent/child registry, and tagged dispatch.
//!
//! Every concrete context embeds a [`ContextHeader`] as its first field and
//! registers a [`MethodTable`] for its [`ContextKind`]. Framework entry
//! points ([`free`], [`realloc`], [`chunk_context`], ...) decode the
//! identity tag from the chunk header preceding a payload and route the
//! operation to the owning implementation, so callers never need to know
//! which context a pointer came from.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use log::trace;

use crate::chunk;
use crate::error::Error;
use crate::stats::Counters;

/// Number of assignable context kinds (the tag field is 3 bits wide).
pub const CONTEXT_KINDS: usize = 8;

/// Identity of a context implementation, stored in every chunk header.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    /// Fixed-size slab context (`mcx-slab`).
    Slab = 0,
}

impl ContextKind {
    /// The 3-bit tag value.
    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Decodes a tag back into a kind.
    #[inline]
    pub fn from_tag(tag: u8) -> Option<ContextKind> {
        match tag {
            0 => Some(ContextKind::Slab),
            _ => None,
        }
    }
}

// =============================================================================
// Method tables
// =============================================================================

/// Operation table registered once per context kind.
///
/// All functions take raw header or payload pointers; the framework
/// guarantees it only hands them pointers whose tag matched the kind the
/// table was registered under.
pub struct MethodTable {
    /// Serve one chunk of the context's configured size.
    pub alloc: unsafe fn(NonNull<ContextHeader>, usize) -> Result<NonNull<u8>, Error>,
    /// Return a payload to its owning context.
    pub free: unsafe fn(NonNull<u8>),
    /// Resize a payload in place, where the kind supports it.
    pub realloc: unsafe fn(NonNull<u8>, usize) -> Result<NonNull<u8>, Error>,
    /// Release every block, keeping the context usable.
    pub reset: unsafe fn(NonNull<ContextHeader>),
    /// Release every block and the context header itself.
    pub delete: unsafe fn(NonNull<ContextHeader>),
    /// Recover the owning context from a payload.
    pub get_chunk_context: unsafe fn(NonNull<u8>) -> NonNull<ContextHeader>,
    /// Total per-chunk footprint (header plus aligned payload) of a payload.
    pub get_chunk_space: unsafe fn(NonNull<u8>) -> usize,
    /// True if the context holds no allocated blocks.
    pub is_empty: unsafe fn(NonNull<ContextHeader>) -> bool,
    /// Accumulate and/or emit memory statistics.
    pub stats: unsafe fn(
        NonNull<ContextHeader>,
        Option<&mut dyn FnMut(&ContextHeader, &str, bool)>,
        Option<&mut Counters>,
        bool,
    ),
    /// Full consistency verification; findings are logged, never raised.
    #[cfg(feature = "memory-checking")]
    pub check: unsafe fn(NonNull<ContextHeader>),
}

static METHOD_TABLES: [AtomicPtr<MethodTable>; CONTEXT_KINDS] = {
    #[allow(clippy::declare_interior_mutable_const)]
    const NONE: AtomicPtr<MethodTable> = AtomicPtr::new(std::ptr::null_mut());
    [NONE; CONTEXT_KINDS]
};

/// Registers the method table for a context kind. Idempotent; later
/// registrations for the same kind replace earlier ones.
pub fn register_kind(kind: ContextKind, table: &'static MethodTable) {
    METHOD_TABLES[kind.tag() as usize]
        .store(table as *const MethodTable as *mut MethodTable, Ordering::Release);
}

fn methods(kind: ContextKind) -> &'static MethodTable {
    let table = METHOD_TABLES[kind.tag() as usize].load(Ordering::Acquire);
    assert!(
        !table.is_null(),
        "no method table registered for context kind {kind:?}"
    );
    unsafe { &*table }
}

// =============================================================================
// Context header
// =============================================================================

/// The framework-owned record embedded first in every concrete context.
///
/// Tracks the context's identity, its attributed memory, and its place in
/// the parent/child hierarchy. Implementations update `mem_allocated`
/// through [`add_allocated`](Self::add_allocated) /
/// [`sub_allocated`](Self::sub_allocated) as blocks come and go.
#[repr(C)]
#[derive(Debug)]
pub struct ContextHeader {
    kind: ContextKind,
    name: &'static str,
    mem_allocated: usize,
    parent: Option<NonNull<ContextHeader>>,
    first_child: Option<NonNull<ContextHeader>>,
    prev_sibling: Option<NonNull<ContextHeader>>,
    next_sibling: Option<NonNull<ContextHeader>>,
}

impl ContextHeader {
    /// The implementation kind of this context.
    #[inline]
    pub fn kind(&self) -> ContextKind {
        self.kind
    }

    /// The statically-lived name given at creation.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Bytes currently attributed to this context (blocks, not the header).
    #[inline]
    pub fn mem_allocated(&self) -> usize {
        self.mem_allocated
    }

    /// The parent context, if any.
    #[inline]
    pub fn parent(&self) -> Option<ContextRef> {
        self.parent.map(ContextRef)
    }

    /// Attributes `bytes` to this context. For context implementations.
    #[inline]
    pub fn add_allocated(&mut self, bytes: usize) {
        self.mem_allocated += bytes;
    }

    /// Removes `bytes` from this context's attribution. For context
    /// implementations.
    #[inline]
    pub fn sub_allocated(&mut self, bytes: usize) {
        debug_assert!(self.mem_allocated >= bytes);
        self.mem_allocated -= bytes;
    }

    /// Creation hook: fills in the header at `this` and links the context
    /// under `parent`.
    ///
    /// This is the type-independent tail of context creation; the
    /// implementation must have finished every fallible step before calling
    /// it, so a half-created context is never observable in the hierarchy.
    ///
    /// # Safety
    ///
    /// `this` must point at uninitialized, writable header storage inside
    /// the new context's allocation. `parent`, if given, must be live.
    pub unsafe fn establish(
        this: NonNull<ContextHeader>,
        kind: ContextKind,
        parent: Option<ContextRef>,
        name: &'static str,
    ) {
        unsafe {
            this.as_ptr().write(ContextHeader {
                kind,
                name,
                mem_allocated: 0,
                parent: parent.map(ContextRef::as_raw),
                first_child: None,
                prev_sibling: None,
                next_sibling: None,
            });

            if let Some(parent) = parent {
                let p = parent.as_raw().as_ptr();
                (*this.as_ptr()).next_sibling = (*p).first_child;
                if let Some(mut old) = (*p).first_child {
                    old.as_mut().prev_sibling = Some(this);
                }
                (*p).first_child = Some(this);
            }
        }
        trace!("established memory context \"{name}\" ({kind:?})");
    }

    /// Removes the context from its parent's child list.
    ///
    /// # Safety
    ///
    /// `this` must point at a live, established header.
    pub unsafe fn unlink_from_parent(this: NonNull<ContextHeader>) {
        unsafe {
            let h = this.as_ptr();
            match (*h).prev_sibling {
                Some(mut prev) => prev.as_mut().next_sibling = (*h).next_sibling,
                None => {
                    if let Some(mut parent) = (*h).parent {
                        debug_assert_eq!(parent.as_ref().first_child, Some(this));
                        parent.as_mut().first_child = (*h).next_sibling;
                    }
                }
            }
            if let Some(mut next) = (*h).next_sibling {
                next.as_mut().prev_sibling = (*h).prev_sibling;
            }
            (*h).parent = None;
            (*h).prev_sibling = None;
            (*h).next_sibling = None;
        }
    }
}

/// Borrowed, untyped handle to a live context.
///
/// A `ContextRef` is just a tagged pointer; it does not keep the context
/// alive. All operations consuming one are `unsafe` for that reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextRef(NonNull<ContextHeader>);

impl ContextRef {
    /// Wraps a raw header pointer.
    ///
    /// # Safety
    ///
    /// `raw` must point at a live, established context header.
    #[inline]
    pub const unsafe fn from_raw(raw: NonNull<ContextHeader>) -> ContextRef {
        ContextRef(raw)
    }

    /// The underlying header pointer.
    #[inline]
    pub fn as_raw(self) -> NonNull<ContextHeader> {
        self.0
    }
}

// =============================================================================
// Pointer-dispatch entry points
// =============================================================================

unsafe fn methods_of_payload(payload: NonNull<u8>) -> &'static MethodTable {
    let header = unsafe { chunk::header_of_payload(payload) };
    let kind = header
        .kind()
        .expect("chunk header carries an unknown context tag");
    methods(kind)
}

/// Returns a payload to whichever context owns it.
///
/// # Safety
///
/// `payload` must have been returned by a context allocation and not freed
/// since.
pub unsafe fn free(payload: NonNull<u8>) {
    unsafe { (methods_of_payload(payload).free)(payload) }
}

/// Resizes a payload in place, where the owning context kind supports it.
///
/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn realloc(payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, Error> {
    unsafe { (methods_of_payload(payload).realloc)(payload, size) }
}

/// Recovers the owning context from a payload pointer.
///
/// # Safety
///
/// Same contract as [`free`], except the payload stays allocated.
pub unsafe fn chunk_context(payload: NonNull<u8>) -> ContextRef {
    unsafe { ContextRef((methods_of_payload(payload).get_chunk_context)(payload)) }
}

/// Reports the total per-chunk footprint of a payload, including its header
/// and alignment padding.
///
/// # Safety
///
/// Same contract as [`chunk_context`].
pub unsafe fn chunk_space(payload: NonNull<u8>) -> usize {
    unsafe { (methods_of_payload(payload).get_chunk_space)(payload) }
}

/// True if the context holds no allocated blocks.
///
/// # Safety
///
/// `cx` must refer to a live context.
pub unsafe fn is_empty(cx: ContextRef) -> bool {
    unsafe {
        let table = methods((*cx.as_raw().as_ptr()).kind);
        (table.is_empty)(cx.as_raw())
    }
}

/// Deletes every child of `cx`, depth first.
///
/// # Safety
///
/// `cx` must refer to a live context; no handles to any descendant may be
/// used afterwards.
pub unsafe fn delete_children(cx: ContextRef) {
    unsafe {
        while let Some(child) = (*cx.as_raw().as_ptr()).first_child {
            delete_context(ContextRef(child));
        }
    }
}

/// Releases all memory held by `cx`, deleting its children first. The
/// context itself stays usable.
///
/// # Safety
///
/// Same contract as [`delete_children`].
pub unsafe fn reset_context(cx: ContextRef) {
    unsafe {
        delete_children(cx);
        let table = methods((*cx.as_raw().as_ptr()).kind);
        (table.reset)(cx.as_raw());
    }
}

/// Deletes `cx` and all of its descendants.
///
/// # Safety
///
/// `cx` must refer to a live context; neither it nor any descendant may be
/// used afterwards.
pub unsafe fn delete_context(cx: ContextRef) {
    unsafe {
        delete_children(cx);
        let raw = cx.as_raw();
        trace!("deleting memory context \"{}\"", (*raw.as_ptr()).name);
        ContextHeader::unlink_from_parent(raw);
        let table = methods((*raw.as_ptr()).kind);
        (table.delete)(raw);
    }
}

/// Runs the stats pass on `cx` and all of its descendants.
///
/// # Safety
///
/// `cx` must refer to a live context.
pub unsafe fn context_stats(
    cx: ContextRef,
    mut emit: Option<&mut dyn FnMut(&ContextHeader, &str, bool)>,
    mut totals: Option<&mut Counters>,
    to_stderr: bool,
) {
    unsafe {
        let table = methods((*cx.as_raw().as_ptr()).kind);
        (table.stats)(
            cx.as_raw(),
            reborrow_emit(&mut emit),
            reborrow_totals(&mut totals),
            to_stderr,
        );

        let mut child = (*cx.as_raw().as_ptr()).first_child;
        while let Some(c) = child {
            context_stats(
                ContextRef(c),
                reborrow_emit(&mut emit),
                reborrow_totals(&mut totals),
                to_stderr,
            );
            child = (*c.as_ptr()).next_sibling;
        }
    }
}

/// Reborrows an optional stats-emit callback with a fresh, shorter lifetime.
///
/// Works around a rustc limitation where `Option<&mut dyn Trait>::as_deref_mut`
/// cannot be called more than once because the compiler fails to shorten the
/// trait object's lifetime on its own.
fn reborrow_emit<'a>(
    emit: &'a mut Option<&mut dyn FnMut(&ContextHeader, &str, bool)>,
) -> Option<&'a mut dyn FnMut(&ContextHeader, &str, bool)> {
    match emit {
        Some(e) => Some(&mut **e),
        None => None,
    }
}

/// Reborrows an optional counters accumulator with a fresh, shorter lifetime.
///
/// See [`reborrow_emit`] for why this helper is needed.
fn reborrow_totals<'a>(totals: &'a mut Option<&mut Counters>) -> Option<&'a mut Counters> {
    match totals {
        Some(t) => Some(&mut **t),
        None => None,
    }
}

/// Runs the consistency check on `cx` and all of its descendants.
///
/// # Safety
///
/// `cx` must refer to a live context.
#[cfg(feature = "memory-checking")]
pub unsafe fn check_context(cx: ContextRef) {
    unsafe {
        let table = methods((*cx.as_raw().as_ptr()).kind);
        (table.check)(cx.as_raw());

        let mut child = (*cx.as_raw().as_ptr()).first_child;
        while let Some(c) = child {
            check_context(ContextRef(c));
            child = (*c.as_ptr()).next_sibling;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn raw_header() -> NonNull<ContextHeader> {
        let boxed = Box::new(MaybeUninit::<ContextHeader>::uninit());
        NonNull::new(Box::into_raw(boxed).cast::<ContextHeader>()).unwrap()
    }

    unsafe fn drop_header(h: NonNull<ContextHeader>) {
        drop(unsafe { Box::from_raw(h.as_ptr().cast::<MaybeUninit<ContextHeader>>()) });
    }

    #[test]
    fn establish_fills_fields() {
        let h = raw_header();
        unsafe {
            ContextHeader::establish(h, ContextKind::Slab, None, "root");
            let header = h.as_ref();
            assert_eq!(header.kind(), ContextKind::Slab);
            assert_eq!(header.name(), "root");
            assert_eq!(header.mem_allocated(), 0);
            assert!(header.parent().is_none());
            assert!(header.first_child.is_none());
            drop_header(h);
        }
    }

    #[test]
    fn children_link_in_creation_order() {
        let parent = raw_header();
        let a = raw_header();
        let b = raw_header();
        unsafe {
            ContextHeader::establish(parent, ContextKind::Slab, None, "parent");
            let pref = ContextRef::from_raw(parent);
            ContextHeader::establish(a, ContextKind::Slab, Some(pref), "a");
            ContextHeader::establish(b, ContextKind::Slab, Some(pref), "b");

            // Newest child sits first.
            assert_eq!(parent.as_ref().first_child, Some(b));
            assert_eq!(b.as_ref().next_sibling, Some(a));
            assert_eq!(a.as_ref().prev_sibling, Some(b));
            assert_eq!(a.as_ref().parent, Some(parent));

            ContextHeader::unlink_from_parent(b);
            assert_eq!(parent.as_ref().first_child, Some(a));
            assert!(a.as_ref().prev_sibling.is_none());

            ContextHeader::unlink_from_parent(a);
            assert!(parent.as_ref().first_child.is_none());

            drop_header(parent);
            drop_header(a);
            drop_header(b);
        }
    }

    #[test]
    fn unlink_middle_child() {
        let parent = raw_header();
        let a = raw_header();
        let b = raw_header();
        let c = raw_header();
        unsafe {
            ContextHeader::establish(parent, ContextKind::Slab, None, "parent");
            let pref = ContextRef::from_raw(parent);
            ContextHeader::establish(a, ContextKind::Slab, Some(pref), "a");
            ContextHeader::establish(b, ContextKind::Slab, Some(pref), "b");
            ContextHeader::establish(c, ContextKind::Slab, Some(pref), "c");
            // child list: c, b, a

            ContextHeader::unlink_from_parent(b);
            assert_eq!(parent.as_ref().first_child, Some(c));
            assert_eq!(c.as_ref().next_sibling, Some(a));
            assert_eq!(a.as_ref().prev_sibling, Some(c));

            drop_header(parent);
            drop_header(a);
            drop_header(b);
            drop_header(c);
        }
    }

    #[test]
    fn attribution_accounting() {
        let h = raw_header();
        unsafe {
            ContextHeader::establish(h, ContextKind::Slab, None, "acct");
            let header = &mut *h.as_ptr();
            header.add_allocated(8192);
            header.add_allocated(8192);
            assert_eq!(header.mem_allocated(), 16384);
            header.sub_allocated(8192);
            assert_eq!(header.mem_allocated(), 8192);
            drop_header(h);
        }
    }

    #[test]
    fn kind_tags_round_trip() {
        assert_eq!(ContextKind::from_tag(ContextKind::Slab.tag()), Some(ContextKind::Slab));
        assert_eq!(ContextKind::from_tag(5), None);
        assert!((ContextKind::Slab.tag() as usize) < CONTEXT_KINDS);
    }
}
