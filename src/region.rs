//! Region allocation: bump-pointer arenas whose lifetime is governed by the
//! same descriptor-buffer machinery as individual objects. Mirrors
//! `regions.h`/`regions.c`: `region_page_t`, `region_t`,
//! `scm_create_region`/`scm_malloc_in_region`/`recycle_region`.
//!
//! A region's `dc` field plays the same role as an object header's
//! counter: it is the number of outstanding descriptor-buffer references
//! to the region, decremented by [`Region::decrement_and_maybe_recycle`]
//! when one of those references expires, and the region is torn down the
//! moment it reaches zero.

use crate::config;
use crate::error::StmError;
use crate::header::{self, ObjectHeader};
use crate::raw_alloc::round_up;
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};

pub const REGION_PAGE_PAYLOAD_SIZE: usize = config::region_page_payload_size();

pub struct RegionPage {
    next: *mut RegionPage,
    memory: Box<[u8; REGION_PAGE_PAYLOAD_SIZE]>,
}

impl RegionPage {
    fn empty() -> RegionPage {
        RegionPage {
            next: ptr::null_mut(),
            memory: Box::new([0u8; REGION_PAGE_PAYLOAD_SIZE]),
        }
    }
}

/// Bounded per-thread cache of freed region pages. Matches
/// `SCM_REGION_PAGE_FREELIST_SIZE`.
pub struct RegionPagePool {
    free: Vec<Box<RegionPage>>,
}

impl RegionPagePool {
    pub fn new() -> RegionPagePool {
        RegionPagePool {
            free: Vec::with_capacity(config::REGION_PAGE_FREELIST_SIZE),
        }
    }

    pub fn acquire(&mut self) -> *mut RegionPage {
        let boxed = self.free.pop().unwrap_or_else(|| Box::new(RegionPage::empty()));
        Box::into_raw(boxed)
    }

    /// # Safety
    /// `page` must have come from `acquire` on this pool and not be used
    /// again by the caller afterward.
    pub unsafe fn release(&mut self, page: *mut RegionPage) {
        let mut boxed = Box::from_raw(page);
        if self.free.len() < config::REGION_PAGE_FREELIST_SIZE {
            boxed.next = ptr::null_mut();
            for b in boxed.memory.iter_mut() {
                *b = 0;
            }
            self.free.push(boxed);
        }
    }
}

impl Default for RegionPagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot of a thread's region table. Starts out unused (`first_page`
/// null); [`Region::activate`] brings it to life, [`Region::malloc`] bumps
/// through its pages, and it tears back down to the unused state once its
/// descriptor count hits zero and it isn't the current tick's "keep one
/// page warm" case.
pub struct Region {
    dc: AtomicI32,
    number_of_region_pages: usize,
    first_page: *mut RegionPage,
    last_page: *mut RegionPage,
    age: u64,
    next_free_address: *mut u8,
    last_address_in_last_page: *mut u8,
}

impl Region {
    pub fn empty() -> Region {
        Region {
            dc: AtomicI32::new(0),
            number_of_region_pages: 0,
            first_page: ptr::null_mut(),
            last_page: ptr::null_mut(),
            age: 0,
            next_free_address: ptr::null_mut(),
            last_address_in_last_page: ptr::null_mut(),
        }
    }

    /// A slot is a candidate for `create_region` if it was never used, or
    /// if it's both stale (not refreshed this tick) and fully dereferenced.
    /// Equivalent to the scan predicate in `scm_create_region`.
    pub fn is_reusable(&self, current_time: u64) -> bool {
        self.first_page.is_null() || (self.age != current_time && self.dc.load(Ordering::Acquire) == 0)
    }

    pub fn is_active(&self) -> bool {
        !self.first_page.is_null()
    }

    /// A region is a zombie once its `age` no longer matches the thread
    /// root's current time — it was live once but hasn't been refreshed
    /// or allocated into since, and is only awaiting recycle. Allocating
    /// or refreshing into a zombie region is the "fatal in debug, silent
    /// no-op in release" case spec'd for zombie clock/region misuse.
    pub fn is_zombie(&self, current_time: u64) -> bool {
        self.is_active() && self.age != current_time
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    /// Brings a reusable slot back to life with a fresh bump pointer,
    /// reusing its first page when one is already resident.
    pub fn activate(&mut self, current_time: u64, initial_dc: i32, pool: &mut RegionPagePool) {
        if self.first_page.is_null() {
            let page = pool.acquire();
            self.first_page = page;
            self.last_page = page;
            self.number_of_region_pages = 1;
        }
        self.reset_bump_pointer_to_first_page();
        self.dc.store(initial_dc, Ordering::Release);
        self.age = current_time;
    }

    fn reset_bump_pointer_to_first_page(&mut self) {
        unsafe {
            self.next_free_address = (*self.first_page).memory.as_mut_ptr();
            self.last_address_in_last_page = self.next_free_address.add(REGION_PAGE_PAYLOAD_SIZE);
        }
    }

    fn grow(&mut self, pool: &mut RegionPagePool) {
        let page = pool.acquire();
        unsafe {
            (*self.last_page).next = page;
            self.last_page = page;
            self.next_free_address = (*page).memory.as_mut_ptr();
            self.last_address_in_last_page = self.next_free_address.add(REGION_PAGE_PAYLOAD_SIZE);
        }
        self.number_of_region_pages += 1;
    }

    /// Bump-allocates `size` bytes inside this region, growing it with a
    /// fresh page when the current one is exhausted. Equivalent to
    /// `scm_malloc_in_region`.
    pub fn malloc(
        &mut self,
        size: usize,
        region_index: i32,
        current_time: u64,
        pool: &mut RegionPagePool,
    ) -> Result<*mut u8, StmError> {
        if self.is_zombie(current_time) {
            config::check_condition(false, "malloc_in_region called on a zombie region");
            return Ok(ptr::null_mut());
        }
        let total = round_up(size + std::mem::size_of::<ObjectHeader>(), 8);
        if total > REGION_PAGE_PAYLOAD_SIZE {
            return Err(StmError::RegionAllocationTooLarge);
        }
        unsafe {
            if self.next_free_address.add(total) > self.last_address_in_last_page {
                self.grow(pool);
            }
            let header_ptr = self.next_free_address as *mut ObjectHeader;
            ptr::write(header_ptr, ObjectHeader::new_region(region_index));
            self.next_free_address = self.next_free_address.add(total);
            Ok(header::payload_of(header_ptr))
        }
    }

    /// Stops this region from being extended on future ticks: its age is
    /// set one tick behind so the next recycle check treats it as stale.
    /// Equivalent to `scm_unregister_region`.
    pub fn unregister(&mut self, current_time: u64) {
        self.age = current_time.wrapping_sub(1);
    }

    /// Adds one more outstanding descriptor reference to this region, used
    /// by `refresh` when a further buffer slot is made to reference it.
    /// Refuses silently once `dc` has saturated at `i32::MAX`, the same
    /// counter-saturation rule an object header's counter follows.
    pub fn try_increment_dc(&self) -> bool {
        let mut current = self.dc.load(Ordering::Relaxed);
        loop {
            if current == i32::MAX {
                return false;
            }
            match self.dc.compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Decrements the descriptor count and recycles the region if it just
    /// hit zero. Returns whether recycling happened. Equivalent to
    /// `expire_region_descriptor_if_exists`.
    pub fn decrement_and_maybe_recycle(&mut self, pool: &mut RegionPagePool, current_time: u64) -> bool {
        let prev = self.dc.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "region descriptor count underflow: recycle invariant violated");
        if prev - 1 == 0 {
            self.recycle(pool, current_time);
            true
        } else {
            false
        }
    }

    /// Tears the region down. A region recycled on the very tick it was
    /// created (`age == current_time`) keeps its first page resident,
    /// zeroed, ready for the next `activate`; any other region (a true
    /// zombie) returns all of its pages to the pool, freeing past the pool
    /// bound, per the "pool up to bound, free the remainder" contract.
    fn recycle(&mut self, pool: &mut RegionPagePool, current_time: u64) {
        if self.age == current_time {
            unsafe {
                let mut p = (*self.first_page).next;
                (*self.first_page).next = ptr::null_mut();
                while !p.is_null() {
                    let next = (*p).next;
                    pool.release(p);
                    p = next;
                }
                for b in (*self.first_page).memory.iter_mut() {
                    *b = 0;
                }
            }
            self.last_page = self.first_page;
            self.number_of_region_pages = 1;
            self.reset_bump_pointer_to_first_page();
        } else {
            unsafe {
                let mut p = self.first_page;
                while !p.is_null() {
                    let next = (*p).next;
                    pool.release(p);
                    p = next;
                }
            }
            self.first_page = ptr::null_mut();
            self.last_page = ptr::null_mut();
            self.number_of_region_pages = 0;
            self.next_free_address = ptr::null_mut();
            self.last_address_in_last_page = ptr::null_mut();
        }
        log::trace!("region recycled ({} pages kept)", self.number_of_region_pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activate_then_malloc_bumps_within_a_page() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        assert!(region.is_reusable(0));
        region.activate(1, 1, &mut pool);
        assert!(!region.is_reusable(1));

        let p1 = region.malloc(16, 3, 1, &mut pool).unwrap();
        let p2 = region.malloc(16, 3, 1, &mut pool).unwrap();
        assert_ne!(p1, p2);
        assert!((p2 as usize) > (p1 as usize));
    }

    #[test]
    fn malloc_grows_across_pages() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(1, 1, &mut pool);
        let big = REGION_PAGE_PAYLOAD_SIZE / 2;
        let _ = region.malloc(big, 0, 1, &mut pool).unwrap();
        let _ = region.malloc(big, 0, 1, &mut pool).unwrap();
        assert_eq!(region.number_of_region_pages, 2);
    }

    #[test]
    fn oversized_allocation_rejected() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(1, 1, &mut pool);
        let err = region.malloc(REGION_PAGE_PAYLOAD_SIZE + 1, 0, 1, &mut pool).unwrap_err();
        assert_eq!(err, StmError::RegionAllocationTooLarge);
    }

    #[test]
    #[should_panic(expected = "zombie region")]
    fn malloc_into_a_zombie_region_is_fatal_in_debug() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(5, 1, &mut pool);
        let _ = region.malloc(16, 0, 6, &mut pool);
    }

    #[test]
    fn recycle_on_same_tick_keeps_one_page() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(5, 1, &mut pool);
        let big = REGION_PAGE_PAYLOAD_SIZE / 2;
        let _ = region.malloc(big, 0, 5, &mut pool).unwrap();
        let _ = region.malloc(big, 0, 5, &mut pool).unwrap();
        assert_eq!(region.number_of_region_pages, 2);

        assert!(region.decrement_and_maybe_recycle(&mut pool, 5));
        assert_eq!(region.number_of_region_pages, 1);
        assert!(region.is_active());
    }

    #[test]
    fn try_increment_dc_refuses_once_saturated() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(1, i32::MAX - 1, &mut pool);
        assert!(region.try_increment_dc());
        assert!(!region.try_increment_dc(), "must refuse once dc saturates");
    }

    #[test]
    fn recycle_as_zombie_frees_everything() {
        let mut pool = RegionPagePool::new();
        let mut region = Region::empty();
        region.activate(5, 1, &mut pool);
        assert!(region.decrement_and_maybe_recycle(&mut pool, 9));
        assert!(!region.is_active());
        assert!(region.is_reusable(9));
    }
}
