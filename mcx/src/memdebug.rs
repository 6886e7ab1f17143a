//! Debug-memory helpers: payload sentinels, poison fills, randomized fills.
//!
//! Compiled only when at least one of the debug features is enabled. The
//! constants are deliberately distinctive so clobbered or overrun memory is
//! recognizable in a debugger.

#[cfg(feature = "randomize-allocated")]
use std::sync::atomic::{AtomicU64, Ordering};

/// Byte written immediately past a payload to detect overruns.
#[cfg(feature = "memory-checking")]
pub const SENTINEL_BYTE: u8 = 0x7E;

/// Byte pattern for freed memory.
#[cfg(feature = "clobber-freed")]
pub const POISON_BYTE: u8 = 0x7F;

/// Writes the sentinel byte at `payload + offset`.
///
/// # Safety
///
/// The byte at `payload + offset` must be writable and outside the payload
/// proper.
#[cfg(feature = "memory-checking")]
#[inline]
pub unsafe fn set_sentinel(payload: std::ptr::NonNull<u8>, offset: usize) {
    unsafe { payload.as_ptr().add(offset).write(SENTINEL_BYTE) }
}

/// Returns true if the sentinel at `payload + offset` is intact.
///
/// # Safety
///
/// A sentinel must have been written at `payload + offset` earlier.
#[cfg(feature = "memory-checking")]
#[inline]
pub unsafe fn sentinel_ok(payload: std::ptr::NonNull<u8>, offset: usize) -> bool {
    unsafe { payload.as_ptr().add(offset).read() == SENTINEL_BYTE }
}

/// Fills a region with the poison pattern.
///
/// # Safety
///
/// `ptr..ptr + len` must be writable.
#[cfg(feature = "clobber-freed")]
#[inline]
pub unsafe fn wipe_region(ptr: *mut u8, len: usize) {
    unsafe { std::ptr::write_bytes(ptr, POISON_BYTE, len) }
}

/// Fills a region with pseudo-random bytes so reads of uninitialized memory
/// produce unstable results instead of silently working.
///
/// # Safety
///
/// `ptr..ptr + len` must be writable.
#[cfg(feature = "randomize-allocated")]
pub unsafe fn randomize_region(ptr: *mut u8, len: usize) {
    static SEED: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

    // xorshift64; the shared seed only needs to make successive fills differ.
    let mut x = SEED.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed) | 1;
    for i in 0..len {
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        unsafe { ptr.add(i).write(x as u8) }
    }
}

#[cfg(test)]
mod tests {
    #[cfg(feature = "memory-checking")]
    #[test]
    fn sentinel_round_trip() {
        use super::*;
        let mut buf = [0u8; 16];
        let payload = std::ptr::NonNull::new(buf.as_mut_ptr()).unwrap();
        unsafe {
            set_sentinel(payload, 8);
            assert!(sentinel_ok(payload, 8));
            buf[8] = 0;
            assert!(!sentinel_ok(payload, 8));
        }
    }

    #[cfg(feature = "clobber-freed")]
    #[test]
    fn wipe_fills_poison() {
        use super::*;
        let mut buf = [0u8; 32];
        unsafe { wipe_region(buf.as_mut_ptr(), buf.len()) };
        assert!(buf.iter().all(|&b| b == POISON_BYTE));
    }

    #[cfg(feature = "randomize-allocated")]
    #[test]
    fn randomize_changes_contents() {
        use super::*;
        let mut a = [0u8; 64];
        let mut b = [0u8; 64];
        unsafe {
            randomize_region(a.as_mut_ptr(), a.len());
            randomize_region(b.as_mut_ptr(), b.len());
        }
        assert_ne!(a, [0u8; 64]);
        assert_ne!(a, b);
    }
}
