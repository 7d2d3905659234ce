//! Descriptor pages: the fixed-size blocks of object-header back-references
//! that get threaded onto the expired list when a buffer slot expires.
//! Mirrors `descriptors.h`/`descriptors.c`'s `descriptor_page_t`,
//! `descriptor_page_list_t` and `expired_descriptor_page_list_t`, plus the
//! bounded per-thread page pool (`new_descriptor_page`/
//! `recycle_descriptor_page`).
//!
//! Pages are managed as raw pointers rather than a safe owned tree, the
//! same way `neptune::pages::PageMgr` threads `Page` pointers through a
//! manual free list: a descriptor page's lifetime is governed by the
//! reclamation protocol, not by Rust ownership, and it moves between three
//! owners (a buffer slot, the expired list, the pool) over its life.

use crate::config;
use crate::header::ObjectHeader;
use std::ptr;

/// Number of descriptor back-references a single page holds.
pub const DESCRIPTORS_PER_PAGE: usize = config::descriptors_per_page();

/// A page of object-header back-references, linked into whichever list
/// currently owns it.
pub struct DescriptorPage {
    next: *mut DescriptorPage,
    number_of_descriptors: usize,
    descriptors: [*mut ObjectHeader; DESCRIPTORS_PER_PAGE],
}

impl DescriptorPage {
    fn empty() -> DescriptorPage {
        DescriptorPage {
            next: ptr::null_mut(),
            number_of_descriptors: 0,
            descriptors: [ptr::null_mut(); DESCRIPTORS_PER_PAGE],
        }
    }

    fn is_full(&self) -> bool {
        self.number_of_descriptors == DESCRIPTORS_PER_PAGE
    }

    fn push(&mut self, header: *mut ObjectHeader) {
        debug_assert!(!self.is_full());
        self.descriptors[self.number_of_descriptors] = header;
        self.number_of_descriptors += 1;
    }
}

/// Bounded per-thread cache of freed descriptor pages, avoiding a
/// malloc/free round trip for the common case of a page expiring and a new
/// one being needed moments later. Matches `SCM_DESCRIPTOR_PAGE_FREELIST_SIZE`.
pub struct DescriptorPagePool {
    free: Vec<Box<DescriptorPage>>,
}

impl DescriptorPagePool {
    pub fn new() -> DescriptorPagePool {
        DescriptorPagePool {
            free: Vec::with_capacity(config::DESCRIPTOR_PAGE_FREELIST_SIZE),
        }
    }

    /// Takes a page from the pool, or allocates a fresh one.
    pub fn acquire(&mut self) -> *mut DescriptorPage {
        let boxed = self.free.pop().unwrap_or_else(|| Box::new(DescriptorPage::empty()));
        Box::into_raw(boxed)
    }

    /// Returns a page to the pool, or frees it outright once the pool is
    /// at capacity.
    ///
    /// # Safety
    /// `page` must have been obtained from `acquire` on this pool (or
    /// built by the same allocator family) and must not be referenced
    /// again by the caller.
    pub unsafe fn release(&mut self, page: *mut DescriptorPage) {
        let mut boxed = Box::from_raw(page);
        if self.free.len() < config::DESCRIPTOR_PAGE_FREELIST_SIZE {
            boxed.next = ptr::null_mut();
            boxed.number_of_descriptors = 0;
            log::trace!("descriptor page pooled ({} pooled)", self.free.len() + 1);
            self.free.push(boxed);
        } else {
            log::trace!("descriptor page pool at capacity, freeing page");
        }
    }
}

impl Default for DescriptorPagePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A singly linked chain of descriptor pages with O(1) append, used while a
/// buffer slot's contents are being moved onto the expired list.
pub struct DescriptorPageList {
    first: *mut DescriptorPage,
    last: *mut DescriptorPage,
}

impl DescriptorPageList {
    pub fn new() -> DescriptorPageList {
        DescriptorPageList {
            first: ptr::null_mut(),
            last: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    /// Appends `header` to the list's tail page, pulling a fresh page from
    /// `pool` if the tail is full or the list is empty. Equivalent to
    /// `descriptors.c::insert_descriptor`.
    pub fn push_descriptor(&mut self, header: *mut ObjectHeader, pool: &mut DescriptorPagePool) {
        unsafe {
            if self.last.is_null() || (*self.last).is_full() {
                let page = pool.acquire();
                if self.last.is_null() {
                    self.first = page;
                } else {
                    (*self.last).next = page;
                }
                self.last = page;
            }
            (*self.last).push(header);
        }
    }

    /// Detaches the entire list, leaving this one empty, and returns the
    /// old `(first, last)` pair — used when a whole buffer slot's worth of
    /// descriptor pages is spliced onto the process expired list.
    pub fn take(&mut self) -> (*mut DescriptorPage, *mut DescriptorPage) {
        let pair = (self.first, self.last);
        self.first = ptr::null_mut();
        self.last = ptr::null_mut();
        pair
    }

    /// Appends another list's pages wholesale onto this one's tail.
    pub fn append(&mut self, first: *mut DescriptorPage, last: *mut DescriptorPage) {
        if first.is_null() {
            return;
        }
        if self.last.is_null() {
            self.first = first;
        } else {
            unsafe {
                (*self.last).next = first;
            }
        }
        self.last = last;
    }
}

impl Default for DescriptorPageList {
    fn default() -> Self {
        Self::new()
    }
}

/// The process/thread-wide list of descriptors whose containing slot has
/// expired but whose finalizer/free step hasn't run yet. Consumption walks
/// the front page left to right; once a page is drained it is recycled and
/// the list advances. Mirrors `expired_descriptor_page_list_t`.
pub struct ExpiredDescriptorPageList {
    list: DescriptorPageList,
    collected: usize,
}

impl ExpiredDescriptorPageList {
    pub fn new() -> ExpiredDescriptorPageList {
        ExpiredDescriptorPageList {
            list: DescriptorPageList::new(),
            collected: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Splices a freshly expired slot's descriptor pages onto the back of
    /// this list.
    pub fn extend(&mut self, first: *mut DescriptorPage, last: *mut DescriptorPage) {
        self.list.append(first, last);
    }

    /// Pops the next expired header, recycling the front page into `pool`
    /// once it has been fully consumed. Equivalent to
    /// `descriptors.c::get_expired_memory`.
    pub fn pop(&mut self, pool: &mut DescriptorPagePool) -> Option<*mut ObjectHeader> {
        if self.list.first.is_null() {
            return None;
        }
        unsafe {
            let front = self.list.first;
            let header = (*front).descriptors[self.collected];
            self.collected += 1;
            if self.collected == (*front).number_of_descriptors {
                let next = (*front).next;
                self.list.first = next;
                if next.is_null() {
                    self.list.last = ptr::null_mut();
                }
                self.collected = 0;
                pool.release(front);
            }
            Some(header)
        }
    }
}

impl Default for ExpiredDescriptorPageList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ObjectHeader;

    fn leak_header(counter: i32) -> *mut ObjectHeader {
        Box::into_raw(Box::new(ObjectHeader::new_counter(counter, -1)))
    }

    #[test]
    fn push_descriptor_spans_pages() {
        let mut pool = DescriptorPagePool::new();
        let mut list = DescriptorPageList::new();
        let total = DESCRIPTORS_PER_PAGE * 2 + 3;
        let headers: Vec<_> = (0..total as i32).map(leak_header).collect();
        for &h in &headers {
            list.push_descriptor(h, &mut pool);
        }
        assert!(!list.is_empty());

        let (first, last) = list.take();
        let mut expired = ExpiredDescriptorPageList::new();
        expired.extend(first, last);

        let mut popped = Vec::new();
        while let Some(h) = expired.pop(&mut pool) {
            popped.push(h);
        }
        assert_eq!(popped, headers);

        for h in headers {
            unsafe {
                drop(Box::from_raw(h));
            }
        }
    }

    #[test]
    fn pool_recycles_up_to_capacity() {
        let mut pool = DescriptorPagePool::new();
        let mut released = Vec::new();
        for _ in 0..(config::DESCRIPTOR_PAGE_FREELIST_SIZE + 5) {
            released.push(pool.acquire());
        }
        for p in released {
            unsafe {
                pool.release(p);
            }
        }
        assert_eq!(pool.free.len(), config::DESCRIPTOR_PAGE_FREELIST_SIZE);
    }
}
