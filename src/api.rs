//! The public allocator surface. Everything here is a thin wrapper around
//! [`crate::thread_root`] and [`crate::finalizer`]; the reclamation logic
//! itself lives in those modules and in `buffer.rs`/`region.rs`. Named and
//! shaped after `scm.h`'s public entry points (`scm_malloc`,
//! `scm_refresh_with_clock`, `scm_tick_clock`, `scm_create_region`, ...).

use crate::error::StmError;
use crate::finalizer::{self, FinalizerFn};
use crate::header::{self, ObjectHeader, Tag};
use crate::raw_alloc::{self, RawAllocator};
use crate::thread_root::{self, ClockScope};
use std::ptr;

fn alloc_with_header(size: usize, counter: i32, finalizer_index: i32) -> *mut u8 {
    let total = header::PAYLOAD_OFFSET + size;
    unsafe {
        let raw = raw_alloc::SYSTEM.alloc(total, 8);
        if raw.is_null() {
            log::warn!("allocation of {} bytes failed", total);
            return ptr::null_mut();
        }
        let header_ptr = raw as *mut ObjectHeader;
        ptr::write(header_ptr, ObjectHeader::new_counter(counter, finalizer_index));
        header::payload_of(header_ptr)
    }
}

/// Allocates `size` bytes with a zeroed, untracked counter: no descriptor
/// references it yet, so nothing will ever expire it until a `refresh`
/// call registers one. Equivalent to `scm_malloc` itself in the source —
/// the descriptor insertion is entirely `refresh`'s doing, not `alloc`'s.
/// Returns null on raw-allocator failure.
pub fn alloc_untracked(size: usize) -> *mut u8 {
    alloc_with_header(size, 0, finalizer::NO_FINALIZER)
}

fn alloc_scoped(size: usize, extension: u32, scope: ClockScope) -> Result<*mut u8, StmError> {
    let payload = alloc_untracked(size);
    if payload.is_null() {
        return Ok(ptr::null_mut());
    }
    let header = unsafe { header::header_of(payload) };
    thread_root::with_current(|root| root.refresh_object(header, scope, extension))?;
    Ok(payload)
}

/// Allocates `size` bytes, set to expire `extension` ticks from now on the
/// calling thread's own clock. Sugar for [`alloc_untracked`] immediately
/// followed by a [`refresh`] claim, the shape most callers actually want.
/// Returns null on allocation failure.
pub fn alloc(size: usize, extension: u32) -> *mut u8 {
    alloc_scoped(size, extension, ClockScope::Local(0)).unwrap_or(ptr::null_mut())
}

/// As [`alloc`], but tracked by one of the thread's extra registered
/// clocks instead of its own.
pub fn alloc_with_clock(size: usize, extension: u32, clock: usize) -> Result<*mut u8, StmError> {
    alloc_scoped(size, extension, ClockScope::Local(clock))
}

/// As [`alloc`], but tracked by the one process-wide global clock.
pub fn global_alloc(size: usize, extension: u32) -> *mut u8 {
    alloc_scoped(size, extension, ClockScope::Global).unwrap_or(ptr::null_mut())
}

/// Allocates `count * size` bytes, zeroed, on the calling thread's own
/// clock.
pub fn calloc(count: usize, size: usize, extension: u32) -> *mut u8 {
    let total = match count.checked_mul(size) {
        Some(t) => t,
        None => {
            log::warn!("calloc({}, {}) overflows", count, size);
            return ptr::null_mut();
        }
    };
    let payload = alloc(total, extension);
    if !payload.is_null() {
        unsafe {
            ptr::write_bytes(payload, 0, total);
        }
    }
    payload
}

/// Always allocates a fresh block and copies the old contents over,
/// matching `scm.c::__wrap_realloc`: there is no way to grow a
/// descriptor-tracked allocation in place, since its size is baked into
/// the raw allocator's bookkeeping for the original request. The old
/// block is freed immediately if and only if its counter is already
/// zero; otherwise [`free`]'s usual no-op leaves it to the ordinary
/// expiration pipeline.
pub fn realloc(old: *mut u8, new_size: usize) -> *mut u8 {
    if old.is_null() {
        return alloc_untracked(new_size);
    }
    unsafe {
        let old_header = header::header_of(old);
        let old_usable = raw_alloc::SYSTEM.usable_size(old_header as *mut u8);
        let copyable = old_usable.saturating_sub(header::PAYLOAD_OFFSET).min(new_size);
        let new_payload = alloc_untracked(new_size);
        if new_payload.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(old, new_payload, copyable);
        free(old);
        new_payload
    }
}

/// Reports the usable payload size of a descriptor-tracked allocation.
/// Undefined for region-allocated memory (DESIGN.md decision 4): rejected
/// via `debug_assert!` in debug builds, returns `0` in release builds.
pub fn usable_size(ptr_in: *mut u8) -> usize {
    if ptr_in.is_null() {
        return 0;
    }
    unsafe {
        let header_ptr = header::header_of(ptr_in);
        match (*header_ptr).tag() {
            Tag::Counter(_) => raw_alloc::SYSTEM
                .usable_size(header_ptr as *mut u8)
                .saturating_sub(header::PAYLOAD_OFFSET),
            Tag::Region(_) => {
                debug_assert!(false, "usable_size is undefined for region-allocated memory");
                0
            }
        }
    }
}

/// Frees `ptr` only if its descriptor counter is exactly zero — no
/// outstanding claim will ever expire it by itself. Otherwise it's a
/// no-op: the memory is already on track to be released by the ordinary
/// expiration pipeline once its remaining claims run out. Any finalizer
/// attached to it still runs (and can veto) at the point it does free.
/// Matches `scm.c::__wrap_free`.
pub fn free(ptr_in: *mut u8) {
    if ptr_in.is_null() {
        return;
    }
    unsafe {
        let header_ptr = header::header_of(ptr_in);
        match (*header_ptr).tag() {
            Tag::Counter(0) => {
                let veto = finalizer::run_finalizer((*header_ptr).finalizer_index(), ptr_in);
                if veto == 0 {
                    raw_alloc::SYSTEM.free(header_ptr as *mut u8);
                } else {
                    log::debug!("finalizer vetoed explicit free at {:p}", ptr_in);
                }
            }
            Tag::Counter(_) => {
                log::debug!("free() no-op at {:p}: descriptor claims still outstanding", ptr_in);
            }
            Tag::Region(_) => {
                debug_assert!(false, "free() cannot be called on region-allocated memory");
            }
        }
    }
}

// ---- lifetime extension --------------------------------------------------

/// Extends `ptr`'s lifetime by `extension` ticks on the thread's own
/// clock, without disturbing the reference it already has. A null `ptr`
/// is silently accepted as a no-op.
pub fn refresh(ptr_in: *mut u8, extension: u32) -> Result<(), StmError> {
    refresh_with_clock(ptr_in, extension, 0)
}

pub fn refresh_with_clock(ptr_in: *mut u8, extension: u32, clock: usize) -> Result<(), StmError> {
    if ptr_in.is_null() {
        return Ok(());
    }
    thread_root::with_current(|root| unsafe {
        root.refresh_object(header::header_of(ptr_in), ClockScope::Local(clock), extension)
    })
}

pub fn global_refresh(ptr_in: *mut u8, extension: u32) -> Result<(), StmError> {
    if ptr_in.is_null() {
        return Ok(());
    }
    thread_root::with_current(|root| unsafe { root.refresh_object(header::header_of(ptr_in), ClockScope::Global, extension) })
}

// ---- regions --------------------------------------------------------------

/// Finds or initializes a region slot and returns its index. The region
/// starts with no outstanding descriptor reference (`dc == 0`): it is a
/// zombie candidate again on the very next tick unless a `refresh_region`/
/// `global_refresh_region` call claims it first. Matches `scm_create_region`,
/// which takes no clock or extension argument either.
pub fn create_region() -> Result<i32, StmError> {
    thread_root::with_current(|root| root.create_region())
}

pub fn malloc_in_region(region: i32, size: usize) -> Result<*mut u8, StmError> {
    thread_root::with_current(|root| root.malloc_in_region(region, size))
}

pub fn refresh_region(region: i32, extension: u32) -> Result<(), StmError> {
    thread_root::with_current(|root| root.refresh_region(region, ClockScope::Local(0), extension))
}

pub fn refresh_region_with_clock(region: i32, extension: u32, clock: usize) -> Result<(), StmError> {
    thread_root::with_current(|root| root.refresh_region(region, ClockScope::Local(clock), extension))
}

pub fn global_refresh_region(region: i32, extension: u32) -> Result<(), StmError> {
    thread_root::with_current(|root| root.refresh_region(region, ClockScope::Global, extension))
}

pub fn unregister_region(region: i32) -> Result<(), StmError> {
    thread_root::with_current(|root| root.unregister_region(region))
}

// ---- clocks -----------------------------------------------------------

pub fn register_clock() -> Result<usize, StmError> {
    thread_root::with_current(|root| root.register_clock())
}

pub fn unregister_clock(id: usize) -> Result<(), StmError> {
    thread_root::with_current(|root| root.unregister_clock(id))
}

// ---- ticking and collection --------------------------------------------

/// Ticks the thread's own clock forward one step.
pub fn tick() -> Result<(), StmError> {
    thread_root::with_current(|root| root.tick_clock(0))
}

pub fn tick_clock(id: usize) -> Result<(), StmError> {
    thread_root::with_current(|root| root.tick_clock(id))
}

/// Completes the calling thread's part of the global rendezvous tick.
pub fn global_tick() {
    thread_root::with_current(|root| root.global_tick());
}

/// Runs one incremental collection step over whatever has already
/// expired, regardless of the `eager-collection` feature.
pub fn collect() {
    thread_root::with_current(|root| root.collect_all());
}

// ---- blocking -----------------------------------------------------------

/// Steps the calling thread out of the global rendezvous, e.g. before a
/// blocking syscall, so other threads' global ticks don't wait on it.
pub fn block_thread() {
    thread_root::with_current(|root| root.block());
}

pub fn resume_thread() {
    thread_root::with_current(|root| root.resume());
}

// ---- finalizers -----------------------------------------------------------

pub fn register_finalizer(f: FinalizerFn) -> Result<i32, StmError> {
    finalizer::register_finalizer(f)
}

pub fn set_finalizer(ptr_in: *mut u8, finalizer_id: i32) {
    unsafe {
        let header_ptr = header::header_of(ptr_in);
        (*header_ptr).set_finalizer_index(finalizer_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn alloc_then_tick_through_expires_and_frees() {
        static DROPPED: AtomicUsize = AtomicUsize::new(0);
        fn on_drop(_payload: *mut u8) -> i32 {
            DROPPED.fetch_add(1, Ordering::SeqCst);
            0
        }

        let finalizer_id = register_finalizer(on_drop).unwrap();
        let p = alloc(32, 1);
        assert!(!p.is_null());
        set_finalizer(p, finalizer_id);

        let before = DROPPED.load(Ordering::SeqCst);
        tick().unwrap();
        collect();
        tick().unwrap();
        collect();
        assert_eq!(DROPPED.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn region_malloc_and_unregister_round_trip() {
        let region = create_region().unwrap();
        let p = malloc_in_region(region, 64).unwrap();
        assert!(!p.is_null());
        assert!(unregister_region(region).is_ok());
    }

    #[test]
    fn usable_size_rejects_region_memory_in_debug() {
        let region = create_region().unwrap();
        let p = malloc_in_region(region, 16).unwrap();
        let result = std::panic::catch_unwind(|| usable_size(p));
        if cfg!(debug_assertions) {
            assert!(result.is_err());
        } else {
            assert_eq!(result.unwrap(), 0);
        }
    }
}
