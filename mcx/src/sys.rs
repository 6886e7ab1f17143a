//! Host memory acquisition for context headers and blocks.

use std::alloc::Layout;
use std::io;
use std::ptr::NonNull;

use crate::MAX_ALIGN;

/// Obtains `size` bytes from the host allocator, aligned to [`MAX_ALIGN`].
///
/// The contents are uninitialized. The region must be returned with
/// [`free_region`] using the same size.
pub fn alloc_region(size: usize) -> io::Result<NonNull<u8>> {
    assert!(size > 0, "allocation size must be non-zero");

    let layout = Layout::from_size_align(size, MAX_ALIGN)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let ptr = unsafe { std::alloc::alloc(layout) };

    NonNull::new(ptr)
        .ok_or_else(|| io::Error::new(io::ErrorKind::OutOfMemory, "host allocation failed"))
}

/// Returns a region to the host allocator.
///
/// # Safety
///
/// `ptr` and `size` must come from a previous [`alloc_region`] call, and the
/// region must not be used afterwards.
pub unsafe fn free_region(ptr: NonNull<u8>, size: usize) {
    let layout = Layout::from_size_align(size, MAX_ALIGN).expect("invalid layout");
    unsafe {
        std::alloc::dealloc(ptr.as_ptr(), layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_small() {
        let region = alloc_region(1).unwrap();
        unsafe { free_region(region, 1) };
    }

    #[test]
    fn region_is_max_aligned() {
        let region = alloc_region(100).unwrap();
        assert_eq!(region.as_ptr() as usize % MAX_ALIGN, 0);
        unsafe { free_region(region, 100) };
    }

    #[test]
    fn can_write_entire_region() {
        let size = 8192;
        let region = alloc_region(size).unwrap();
        unsafe {
            std::ptr::write_bytes(region.as_ptr(), 0xAB, size);
            assert_eq!(*region.as_ptr(), 0xAB);
            assert_eq!(*region.as_ptr().add(size - 1), 0xAB);
            free_region(region, size);
        }
    }

    #[test]
    #[should_panic(expected = "non-zero")]
    fn alloc_zero_panics() {
        let _ = alloc_region(0);
    }

    #[test]
    fn regions_are_distinct() {
        let a = alloc_region(256).unwrap();
        let b = alloc_region(256).unwrap();
        assert_ne!(a, b);
        unsafe {
            free_region(a, 256);
            free_region(b, 256);
        }
    }
}
