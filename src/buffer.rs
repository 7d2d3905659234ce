//! Descriptor buffers: the circular array of descriptor-page-list slots
//! indexed by residual lifetime, used both for locally-clocked and
//! globally-clocked objects/regions. Mirrors `descriptors.h`'s
//! `descriptor_buffer_t` and the `insert_descriptor`/`expire_buffer`/
//! `increment_current_index` trio in `descriptors.c`.
//!
//! A local buffer has `MAX_EXPIRATION_EXTENSION + 1` slots, a global one
//! `MAX_EXPIRATION_EXTENSION + 2` (one extra slot of slack for the
//! rendezvous delay between a thread observing `global_time` and every
//! thread finishing its own tick). Both share this same type, parameterized
//! by slot count at construction, matching the C source's reuse of one
//! struct for both buffer flavors.

use crate::header::ObjectHeader;
use crate::page::{DescriptorPageList, DescriptorPagePool, ExpiredDescriptorPageList};

pub struct DescriptorBuffer {
    slots: Vec<DescriptorPageList>,
    current_index: usize,
    age: u64,
}

impl DescriptorBuffer {
    pub fn new(length: usize) -> DescriptorBuffer {
        assert!(length > 0, "a descriptor buffer needs at least one slot");
        DescriptorBuffer {
            slots: (0..length).map(|_| DescriptorPageList::new()).collect(),
            current_index: 0,
            age: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn age(&self) -> u64 {
        self.age
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// A buffer is stale once it hasn't been ticked at the clock's current
    /// time; this is how the reclamation protocol tells a live buffer from
    /// a zombie left behind by a terminated or reassigned clock.
    pub fn is_stale(&self, current_time: u64) -> bool {
        self.age != current_time
    }

    /// True once every slot is empty — a stale buffer stops needing
    /// round-robin sweeping the moment this is true.
    pub fn is_fully_drained(&self) -> bool {
        self.slots.iter().all(DescriptorPageList::is_empty)
    }

    /// Records a descriptor that should expire `extension` ticks from now.
    /// Equivalent to `descriptors.c::insert_descriptor`.
    pub fn insert(&mut self, extension: u32, header: *mut ObjectHeader, pool: &mut DescriptorPagePool) {
        let extension = extension as usize;
        debug_assert!(extension < self.slots.len(), "extension exceeds buffer capacity");
        let idx = (self.current_index + extension) % self.slots.len();
        self.slots[idx].push_descriptor(header, pool);
    }

    /// Advances the buffer by one tick: the current slot (everything whose
    /// countdown just reached zero) is spliced onto `expired`, and the slot
    /// is reset to empty for future reuse. `age` is untouched — it is
    /// stamped only at registration time, not on every tick, so it keeps
    /// distinguishing a live buffer from a zombie left behind by a
    /// terminated or reassigned clock. Equivalent to
    /// `descriptors.c::expire_buffer` followed by `increment_current_index`.
    pub fn tick(&mut self, expired: &mut ExpiredDescriptorPageList) {
        let victim = self.current_index;
        let (first, last) = self.slots[victim].take();
        expired.extend(first, last);
        self.current_index = (self.current_index + 1) % self.slots.len();
    }

    /// Stamps this buffer as claimed for the current epoch — called when a
    /// clock (or the root itself) is (re)registered. Equivalent to the
    /// `age = current_time` assignments in `register_thread`/
    /// `scm_register_clock`.
    pub fn claim(&mut self, current_time: u64) {
        self.age = current_time;
    }

    /// Splices every slot's contents onto `expired` at once, without
    /// waiting for each one's natural countdown. Used when a clock is
    /// unregistered and its buffer must give up everything it's holding.
    pub fn drain_all(&mut self, expired: &mut ExpiredDescriptorPageList) {
        for slot in &mut self.slots {
            let (first, last) = slot.take();
            expired.extend(first, last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::ObjectHeader;

    fn leak_header() -> *mut ObjectHeader {
        Box::into_raw(Box::new(ObjectHeader::new_counter(1, -1)))
    }

    #[test]
    fn insert_then_tick_through_expires_at_the_right_time() {
        let mut pool = DescriptorPagePool::new();
        let mut buf = DescriptorBuffer::new(4);
        let h = leak_header();
        buf.insert(2, h, &mut pool);

        let mut expired = ExpiredDescriptorPageList::new();
        buf.tick(&mut expired);
        assert!(expired.is_empty(), "must not expire before its extension elapses");
        buf.tick(&mut expired);
        assert!(expired.is_empty());
        buf.tick(&mut expired);
        assert!(!expired.is_empty(), "descriptor should expire on the third tick");

        let popped = expired.pop(&mut pool);
        assert_eq!(popped, Some(h));
        unsafe {
            drop(Box::from_raw(h));
        }
    }

    #[test]
    fn stale_and_drained_tracking() {
        let mut buf = DescriptorBuffer::new(3);
        assert!(buf.is_stale(1));
        assert!(buf.is_fully_drained());

        buf.claim(1);
        assert!(!buf.is_stale(1));
        assert!(buf.is_stale(2), "age is stamped only on claim, not on every tick");

        let mut expired = ExpiredDescriptorPageList::new();
        buf.tick(&mut expired);
        assert!(buf.is_stale(1), "ticking must not touch age");
    }
}
