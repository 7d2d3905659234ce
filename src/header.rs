//! The per-object header that precedes every payload returned by `alloc`.
//! Mirrors `scm.h`'s `object_header_t` and its `OBJECT_HEADER`/
//! `PAYLOAD_OFFSET` macros: a single word does double duty as either a
//! descriptor's expiration counter or a region tag, decoded by its sign bit
//! (`HB_MASK`). Kept as one `AtomicI32` rather than a Rust enum, per
//! DESIGN.md decision 1 — an enum can't be mutated with a single lock-free
//! read-modify-write, and the counter is the only field ever touched from
//! more than one thread.

use crate::raw_alloc::round_up;
use std::sync::atomic::{AtomicI32, Ordering};

/// Sign bit of the tag word: set means "this is a region index", clear
/// means "this is a descriptor expiration counter". Equivalent to
/// `HB_MASK` (`UINT_MAX - INT_MAX`) in `scm.h`.
const HB_MASK: i32 = i32::MIN;

/// Decoded form of the header's tag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Object lives in a descriptor buffer; value is the live-reference
    /// countdown (reaches zero when the last referencing slot expires).
    Counter(i32),
    /// Object was bump-allocated inside a region; value is the owning
    /// region's index.
    Region(i32),
}

impl Tag {
    fn decode(raw: i32) -> Tag {
        if raw & HB_MASK != 0 {
            Tag::Region(raw & !HB_MASK)
        } else {
            Tag::Counter(raw)
        }
    }

    fn encode_region(index: i32) -> i32 {
        debug_assert!(index & HB_MASK == 0, "region index must not use the tag bit");
        index | HB_MASK
    }
}

/// The header prepended to every object returned by [`crate::api::alloc`].
/// `finalizer_index` is written once at allocation time and read only by
/// the thread that owns the object's descriptor slot, so it needs no
/// synchronization; `counter_or_region` is the one field mutated from other
/// threads (by a concurrent `refresh`) and is therefore atomic.
#[repr(C)]
pub struct ObjectHeader {
    counter_or_region: AtomicI32,
    finalizer_index: i32,
}

/// Header size rounded up to 8 bytes, matching `libscm.h`'s `CACHEALIGN`
/// applied to `sizeof(object_header_t)` so payloads stay naturally aligned.
pub const PAYLOAD_OFFSET: usize = round_up(std::mem::size_of::<ObjectHeader>(), 8);

impl ObjectHeader {
    /// Builds a header for an object freshly inserted into a descriptor
    /// buffer with initial expiration count `counter`.
    pub fn new_counter(counter: i32, finalizer_index: i32) -> ObjectHeader {
        ObjectHeader {
            counter_or_region: AtomicI32::new(counter),
            finalizer_index,
        }
    }

    /// Builds a header for an object bump-allocated inside region
    /// `region_index`. Region-allocated objects have no individual
    /// finalizer; the region itself is finalized as a unit.
    pub fn new_region(region_index: i32) -> ObjectHeader {
        ObjectHeader {
            counter_or_region: AtomicI32::new(Tag::encode_region(region_index)),
            finalizer_index: -1,
        }
    }

    /// Decodes the current tag. Uses `Relaxed` ordering: callers that need
    /// to order this read against other memory must add their own fence
    /// (the reclamation protocol's rendezvous barrier provides one).
    pub fn tag(&self) -> Tag {
        Tag::decode(self.counter_or_region.load(Ordering::Relaxed))
    }

    /// Atomically decrements the counter and reports whether it reached
    /// zero. Only meaningful when `tag()` is `Counter`; callers must not
    /// call this on a region-tagged header.
    pub fn decrement_and_test(&self) -> bool {
        let prev = self.counter_or_region.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & HB_MASK == 0, "decrement_and_test on a region-tagged header");
        prev - 1 == 0
    }

    /// Replaces a descriptor counter with a fresh value (used when an
    /// object is reinserted into a new buffer slot on `refresh`).
    pub fn set_counter(&self, counter: i32) {
        self.counter_or_region.store(counter, Ordering::Release);
    }

    /// Adds one more outstanding reference, used by `refresh`: the object
    /// is inserted into a further buffer slot without removing the
    /// reference it already had, so its survival count grows by one.
    /// Refuses silently (returns `false`, counter untouched) once the
    /// counter has saturated at `i32::MAX`, matching the source's
    /// "counter already INT_MAX" refusal.
    pub fn try_increment(&self) -> bool {
        let mut current = self.counter_or_region.load(Ordering::Relaxed);
        loop {
            debug_assert!(current & HB_MASK == 0, "try_increment on a region-tagged header");
            if current == i32::MAX {
                return false;
            }
            match self
                .counter_or_region
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn finalizer_index(&self) -> i32 {
        self.finalizer_index
    }

    /// Attaches a finalizer to an already-allocated object. Only the
    /// owning thread ever calls this, so no synchronization is needed.
    pub fn set_finalizer_index(&mut self, index: i32) {
        self.finalizer_index = index;
    }
}

/// Recovers the header immediately preceding a payload pointer.
///
/// # Safety
/// `payload` must have been returned by [`crate::api::alloc`] (or a
/// sibling allocation entry point) and still be live.
#[inline(always)]
pub unsafe fn header_of(payload: *mut u8) -> *mut ObjectHeader {
    payload.sub(PAYLOAD_OFFSET) as *mut ObjectHeader
}

/// Computes the payload pointer that follows a header.
///
/// # Safety
/// `header` must point at a valid, initialized `ObjectHeader` at the start
/// of an allocation at least `PAYLOAD_OFFSET + size` bytes long.
#[inline(always)]
pub unsafe fn payload_of(header: *mut ObjectHeader) -> *mut u8 {
    (header as *mut u8).add(PAYLOAD_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_round_trips() {
        let h = ObjectHeader::new_counter(3, 7);
        assert_eq!(h.tag(), Tag::Counter(3));
        assert_eq!(h.finalizer_index(), 7);
    }

    #[test]
    fn region_tag_round_trips() {
        let h = ObjectHeader::new_region(4);
        assert_eq!(h.tag(), Tag::Region(4));
        assert_eq!(h.finalizer_index(), -1);
    }

    #[test]
    fn decrement_and_test_reaches_zero() {
        let h = ObjectHeader::new_counter(2, -1);
        assert!(!h.decrement_and_test());
        assert!(h.decrement_and_test());
    }

    #[test]
    fn try_increment_refuses_once_saturated() {
        let h = ObjectHeader::new_counter(i32::MAX - 1, -1);
        assert!(h.try_increment());
        assert_eq!(h.tag(), Tag::Counter(i32::MAX));
        assert!(!h.try_increment(), "must refuse once the counter saturates");
        assert_eq!(h.tag(), Tag::Counter(i32::MAX), "counter must stay untouched on refusal");
    }

    #[test]
    fn header_payload_pointer_arithmetic_round_trips() {
        let mut buf = vec![0u8; PAYLOAD_OFFSET + 32];
        let header_ptr = buf.as_mut_ptr() as *mut ObjectHeader;
        unsafe {
            std::ptr::write(header_ptr, ObjectHeader::new_counter(1, -1));
            let payload = payload_of(header_ptr);
            assert_eq!(header_of(payload), header_ptr);
        }
    }
}
