//! The byte allocator backend, consumed only through the three opaque hooks
//! named in spec.md §6 (`raw_alloc`/`raw_free`/`raw_usable_size`). Kept out
//! of the reclamation core deliberately: everything above this module talks
//! only to a `RawAllocator`, never to `libc` directly, the same boundary
//! `neptune` draws around `PageMgr::alloc_unmanaged_array` (`pages.rs`).

/// A pluggable byte-allocator backend. The default (`SystemAllocator`) wraps
/// libc, same as the C original's `__real_malloc`/`__real_free`/
/// `__real_malloc_usable_size`.
pub trait RawAllocator: Send + Sync {
    /// Allocates at least `bytes` bytes, aligned to `align` (a power of
    /// two). Returns null on failure.
    unsafe fn alloc(&self, bytes: usize, align: usize) -> *mut u8;

    /// Frees a pointer previously returned by `alloc` on this allocator.
    unsafe fn free(&self, ptr: *mut u8);

    /// Reports the number of bytes actually usable at `ptr`, which may be
    /// larger than what was requested.
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
}

/// Default backend: the process libc allocator.
pub struct SystemAllocator;

impl RawAllocator for SystemAllocator {
    unsafe fn alloc(&self, bytes: usize, align: usize) -> *mut u8 {
        if bytes == 0 {
            return std::ptr::null_mut();
        }
        if align <= std::mem::size_of::<usize>() * 2 {
            libc::malloc(bytes) as *mut u8
        } else {
            let mut out: *mut libc::c_void = std::ptr::null_mut();
            let rc = libc::posix_memalign(&mut out, align, bytes);
            if rc != 0 {
                std::ptr::null_mut()
            } else {
                out as *mut u8
            }
        }
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if !ptr.is_null() {
            libc::free(ptr as *mut libc::c_void);
        }
    }

    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            0
        } else {
            libc::malloc_usable_size(ptr as *mut libc::c_void)
        }
    }
}

/// Process-wide default raw allocator. Exposed so `ThreadRoot` can reach it
/// without threading a reference through every call; matches the way
/// `neptune::pages::PageMgr` reaches `libc` directly rather than taking an
/// allocator parameter.
pub static SYSTEM: SystemAllocator = SystemAllocator;

/// Rounds `size` up to the next multiple of `align` (`align` a power of two).
/// Equivalent to `libscm.h`'s `ROUND_UP`/`CACHEALIGN` macros.
#[inline(always)]
pub const fn round_up(size: usize, align: usize) -> usize {
    (size + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_up_aligns() {
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(round_up(0, 8), 0);
    }

    #[test]
    fn system_allocator_round_trips() {
        unsafe {
            let p = SYSTEM.alloc(64, 8);
            assert!(!p.is_null());
            assert!(SYSTEM.usable_size(p) >= 64);
            SYSTEM.free(p);
        }
    }

    #[test]
    fn system_allocator_honors_large_alignment() {
        unsafe {
            let p = SYSTEM.alloc(4096, 4096);
            assert!(!p.is_null());
            assert_eq!(p as usize % 4096, 0);
            SYSTEM.free(p);
        }
    }
}
