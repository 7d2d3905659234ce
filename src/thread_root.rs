//! Per-thread reclamation state. Mirrors `descriptor_root_t` in
//! `descriptors.h`: every thread lazily gets its own set of descriptor
//! buffers, region table, and page pools the first time it touches the
//! allocator, kept in thread-local storage and handed back to a
//! process-wide freelist when the thread exits (`terminated_descriptor_roots`
//! in `scm.c`).
//!
//! A recycled root isn't wiped: its buffers and regions are zombie-ized by
//! bumping `current_time` so nothing in them looks current any more, and
//! the round-robin sweep in later ticks drains whatever they were still
//! holding. This avoids freeing and re-allocating the whole per-thread
//! structure on every thread churn, the same trade-off `register_thread`
//! makes in the C source.

use crate::buffer::DescriptorBuffer;
use crate::config;
use crate::error::StmError;
use crate::finalizer;
use crate::global_clock;
use crate::header::{self, ObjectHeader};
use crate::page::{DescriptorPagePool, ExpiredDescriptorPageList};
use crate::raw_alloc::{self, RawAllocator};
use crate::region::{Region, RegionPagePool};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::cell::RefCell;

/// Selects which descriptor buffer an insertion or refresh targets: the
/// thread's own clock (`Local(0)`), one of its extra registered clocks, or
/// the one process-wide global clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockScope {
    Global,
    Local(usize),
}

pub struct ThreadRoot {
    global_phase: u64,
    current_time: u64,
    round_robin: usize,
    blocked: bool,

    descriptor_page_pool: DescriptorPagePool,
    region_page_pool: RegionPagePool,

    expired_objects: ExpiredDescriptorPageList,
    expired_regions: ExpiredDescriptorPageList,

    global_obj_buffer: DescriptorBuffer,
    global_reg_buffer: DescriptorBuffer,

    local_obj_buffers: Vec<DescriptorBuffer>,
    local_reg_buffers: Vec<DescriptorBuffer>,
    clock_in_use: Vec<bool>,

    regions: Vec<Region>,
    next_reg_index: usize,
    next_clock_index: usize,
}

// Every field is either owned data or a raw pointer only ever touched by
// the thread that currently owns this root (live in its TLS slot, or
// parked untouched on the terminated-roots freelist). Parking it there
// requires `Send`.
unsafe impl Send for ThreadRoot {}

impl ThreadRoot {
    fn fresh(global_phase: u64) -> ThreadRoot {
        let mut clock_in_use = vec![false; config::MAX_CLOCKS];
        clock_in_use[0] = true;
        let mut root = ThreadRoot {
            global_phase,
            current_time: 0,
            round_robin: 0,
            blocked: false,
            descriptor_page_pool: DescriptorPagePool::new(),
            region_page_pool: RegionPagePool::new(),
            expired_objects: ExpiredDescriptorPageList::new(),
            expired_regions: ExpiredDescriptorPageList::new(),
            global_obj_buffer: DescriptorBuffer::new(config::global_buffer_length()),
            global_reg_buffer: DescriptorBuffer::new(config::global_buffer_length()),
            local_obj_buffers: (0..config::MAX_CLOCKS)
                .map(|_| DescriptorBuffer::new(config::local_buffer_length()))
                .collect(),
            local_reg_buffers: (0..config::MAX_CLOCKS)
                .map(|_| DescriptorBuffer::new(config::local_buffer_length()))
                .collect(),
            clock_in_use,
            regions: (0..config::MAX_REGIONS).map(|_| Region::empty()).collect(),
            next_reg_index: 0,
            next_clock_index: 1,
        };
        root.local_obj_buffers[0].claim(0);
        root.local_reg_buffers[0].claim(0);
        root
    }

    /// Zombie-izes everything this (reused) root was holding by bumping
    /// `current_time` past every buffer's and region's stamped `age`, then
    /// re-claims clock 0's own buffers for the new epoch — the same
    /// "register_thread bumps current_time and stamps the default clock's
    /// age" pair the source performs whenever a terminated thread's slot is
    /// handed to a new thread.
    fn recycle(mut self: Box<Self>, global_phase: u64) -> Box<ThreadRoot> {
        self.current_time = self.current_time.wrapping_add(1);
        self.global_phase = global_phase;
        self.round_robin = 0;
        self.blocked = false;
        self.next_reg_index = 0;
        self.next_clock_index = 1;
        for used in self.clock_in_use.iter_mut().skip(1) {
            *used = false;
        }
        let current_time = self.current_time;
        self.local_obj_buffers[0].claim(current_time);
        self.local_reg_buffers[0].claim(current_time);
        log::debug!("recycled a terminated thread root at time {}", self.current_time);
        self
    }

    // ---- object lifetime -------------------------------------------------

    /// Whether `scope` names a clock this thread actually has registered.
    /// The global clock is always valid; a local clock must be in range
    /// and currently in use.
    fn clock_is_valid(&self, scope: ClockScope) -> bool {
        match scope {
            ClockScope::Global => true,
            ClockScope::Local(id) => id < self.local_obj_buffers.len() && self.clock_in_use[id],
        }
    }

    /// Records a reference to `header` in the chosen buffer, to expire
    /// `extension` ticks from now. Equivalent to `descriptors.c::insert_descriptor`
    /// applied to the object buffers. A global-scoped insertion gets `extension
    /// + 2`: slack so every other thread can perform its own matching
    /// `global_refresh` on the same object before the next global time
    /// advance, per `scm_global_refresh`'s doc comment in the source.
    ///
    /// The caller is responsible for having already checked
    /// [`ThreadRoot::clock_is_valid`] for `scope`.
    fn insert_object(&mut self, header: *mut ObjectHeader, scope: ClockScope, extension: u32) {
        let extension = clamp_extension(extension);
        match scope {
            ClockScope::Global => {
                self.global_obj_buffer
                    .insert(extension + 2, header, &mut self.descriptor_page_pool);
            }
            ClockScope::Local(id) => {
                self.local_obj_buffers[id].insert(extension, header, &mut self.descriptor_page_pool);
            }
        }
    }

    /// Extends an already-live object's lifetime: bumps its survival count
    /// and records one more reference in the chosen buffer, without
    /// disturbing the reference it already has. A bad or unregistered
    /// clock is a silent no-op (spec.md §7 "invalid id ⇒ silent no-op"),
    /// checked *before* the counter is touched, so a rejected insertion
    /// never leaves the counter incremented with nothing backing it.
    /// Likewise silently refused once the counter has saturated at
    /// `i32::MAX`, with no buffer insertion.
    pub fn refresh_object(&mut self, header: *mut ObjectHeader, scope: ClockScope, extension: u32) -> Result<(), StmError> {
        if !self.clock_is_valid(scope) {
            log::debug!("refresh against an invalid or unregistered clock: no-op");
            return Ok(());
        }
        if !unsafe { (*header).try_increment() } {
            log::debug!("refresh refused: counter saturated at {:p}", header);
            return Ok(());
        }
        self.insert_object(header, scope, extension);
        Ok(())
    }

    pub(crate) fn expire_object(header_ptr: *mut ObjectHeader) {
        unsafe {
            let header = &*header_ptr;
            if header.decrement_and_test() {
                let payload = header::payload_of(header_ptr);
                let veto = finalizer::run_finalizer(header.finalizer_index(), payload);
                if veto == 0 {
                    raw_alloc::SYSTEM.free(header_ptr as *mut u8);
                } else {
                    log::debug!("finalizer vetoed free for object at {:p}", header_ptr);
                }
            }
        }
    }

    // ---- region lifetime ---------------------------------------------

    fn encode_region_ref(region_index: i32) -> *mut ObjectHeader {
        region_index as usize as *mut ObjectHeader
    }

    fn decode_region_ref(ptr: *mut ObjectHeader) -> i32 {
        ptr as usize as i32
    }

    /// A global-scoped region reference gets the same `extension + 2` slack
    /// as [`ThreadRoot::insert_object`], per `scm_global_refresh_region`.
    ///
    /// The caller is responsible for having already checked
    /// [`ThreadRoot::clock_is_valid`] for `scope`.
    fn insert_region_ref(&mut self, region_index: i32, scope: ClockScope, extension: u32) {
        let extension = clamp_extension(extension);
        let encoded = Self::encode_region_ref(region_index);
        match scope {
            ClockScope::Global => {
                self.global_reg_buffer
                    .insert(extension + 2, encoded, &mut self.descriptor_page_pool);
            }
            ClockScope::Local(id) => {
                self.local_reg_buffers[id].insert(extension, encoded, &mut self.descriptor_page_pool);
            }
        }
    }

    /// Finds a reusable region slot (never used, or stale and fully
    /// dereferenced) and activates it with `dc` at zero — no descriptor
    /// references it yet, so it stays a zombie candidate until a
    /// `refresh_region`/`global_refresh_region` call claims it. Equivalent
    /// to `scm_create_region`, which likewise never touches a descriptor
    /// buffer itself.
    pub fn create_region(&mut self) -> Result<i32, StmError> {
        let len = self.regions.len();
        let start = self.next_reg_index;
        for offset in 0..len {
            let i = (start + offset) % len;
            if self.regions[i].is_reusable(self.current_time) {
                self.regions[i].activate(self.current_time, 0, &mut self.region_page_pool);
                self.next_reg_index = (i + 1) % len;
                return Ok(i as i32);
            }
        }
        log::warn!("region table full ({} regions in use)", len);
        Err(StmError::RegionTableFull)
    }

    pub fn malloc_in_region(&mut self, region_index: i32, size: usize) -> Result<*mut u8, StmError> {
        let current_time = self.current_time;
        let region = self
            .regions
            .get_mut(region_index as usize)
            .ok_or(StmError::InvalidRegion(region_index))?;
        region.malloc(size, region_index, current_time, &mut self.region_page_pool)
    }

    /// Adds one more outstanding reference to a region, the region
    /// equivalent of [`ThreadRoot::refresh_object`]. A bad or unregistered
    /// clock is checked *before* `dc` is touched, same as `refresh_object`,
    /// so a rejected insertion never leaves `dc` incremented with nothing
    /// backing it. Otherwise silently refused if the region is a zombie
    /// (fatal in debug builds) or its `dc` has saturated.
    pub fn refresh_region(&mut self, region_index: i32, scope: ClockScope, extension: u32) -> Result<(), StmError> {
        if !self.clock_is_valid(scope) {
            log::debug!("refresh_region against an invalid or unregistered clock: no-op");
            return Ok(());
        }
        let current_time = self.current_time;
        let region = self
            .regions
            .get_mut(region_index as usize)
            .ok_or(StmError::InvalidRegion(region_index))?;
        if region.is_zombie(current_time) {
            config::check_condition(false, "refresh_region called on a zombie region");
            return Ok(());
        }
        if !region.try_increment_dc() {
            log::debug!("refresh_region refused: dc saturated for region {}", region_index);
            return Ok(());
        }
        self.insert_region_ref(region_index, scope, extension);
        Ok(())
    }

    pub fn unregister_region(&mut self, region_index: i32) -> Result<(), StmError> {
        let current_time = self.current_time;
        let region = self
            .regions
            .get_mut(region_index as usize)
            .ok_or(StmError::InvalidRegion(region_index))?;
        region.unregister(current_time);
        Ok(())
    }

    fn expire_region_ref(&mut self, region_index: i32) {
        if let Some(region) = self.regions.get_mut(region_index as usize) {
            region.decrement_and_maybe_recycle(&mut self.region_page_pool, self.current_time);
        } else {
            log::warn!("expired descriptor referenced out-of-range region {}", region_index);
        }
    }

    // ---- clocks ------------------------------------------------------

    /// Reserves an additional named clock for this thread, with its own
    /// buffers. Equivalent to `scm_register_clock`'s reusable-slot scan.
    pub fn register_clock(&mut self) -> Result<usize, StmError> {
        let slots = self.clock_in_use.len();
        if slots <= 1 {
            return Err(StmError::ClockTableFull);
        }
        let current_time = self.current_time;
        let start = self.next_clock_index.max(1);
        for offset in 0..(slots - 1) {
            let i = 1 + (start - 1 + offset) % (slots - 1);
            if !self.clock_in_use[i] {
                self.clock_in_use[i] = true;
                self.local_obj_buffers[i] = DescriptorBuffer::new(config::local_buffer_length());
                self.local_reg_buffers[i] = DescriptorBuffer::new(config::local_buffer_length());
                self.local_obj_buffers[i].claim(current_time);
                self.local_reg_buffers[i].claim(current_time);
                self.next_clock_index = if i + 1 >= slots { 1 } else { i + 1 };
                return Ok(i);
            }
        }
        log::warn!("clock table full ({} clocks in use)", slots);
        Err(StmError::ClockTableFull)
    }

    /// Drains a named clock's buffers onto the expired lists and frees the
    /// slot for reuse. Clock 0 (the thread's own) cannot be unregistered.
    pub fn unregister_clock(&mut self, id: usize) -> Result<(), StmError> {
        if id == 0 || id >= self.clock_in_use.len() || !self.clock_in_use[id] {
            return Err(StmError::InvalidClock(id as i32));
        }
        self.local_obj_buffers[id].drain_all(&mut self.expired_objects);
        self.local_reg_buffers[id].drain_all(&mut self.expired_regions);
        self.clock_in_use[id] = false;
        Ok(())
    }

    /// Ticks clock `id`'s buffers forward one step, sweeps exactly one
    /// zombie buffer (DESIGN.md decision 2), and runs the configured
    /// collection policy. Equivalent to `scm_tick_clock`/
    /// `increment_and_expire_clock`: this only advances the buffer's own
    /// `current_index`, it never touches `current_time` — that only
    /// advances at thread (re)registration, the way it distinguishes a
    /// live buffer's `age` from a zombie's.
    pub fn tick_clock(&mut self, id: usize) -> Result<(), StmError> {
        if id >= self.local_obj_buffers.len() || !self.clock_in_use[id] {
            return Err(StmError::InvalidClock(id as i32));
        }
        self.local_obj_buffers[id].tick(&mut self.expired_objects);
        self.local_reg_buffers[id].tick(&mut self.expired_regions);
        self.sweep_one_zombie();
        self.run_collection_policy();
        Ok(())
    }

    /// Completes this thread's global tick for the current round, if it
    /// hasn't already. A thread only expires its globally-clocked buffers
    /// on its first tick since the last global time advance — once
    /// `global_phase` has caught up to the global clock's current time, a
    /// further call this round is a no-op. Equivalent to `scm_global_tick`.
    pub fn global_tick(&mut self) {
        if self.global_phase != global_clock::GLOBAL.current_time() {
            return;
        }
        let outcome = global_clock::GLOBAL.tick();
        self.global_phase = outcome.ticked_for + 1;
        self.global_obj_buffer.tick(&mut self.expired_objects);
        self.global_reg_buffer.tick(&mut self.expired_regions);
        self.sweep_one_zombie();
        self.run_collection_policy();
    }

    /// Advances the round-robin cursor by one and ticks that buffer only
    /// if it is a stale, not-yet-drained zombie. This is the one-buffer-
    /// per-call sweep from DESIGN.md decision 2. Clock 0 (the thread's own,
    /// always live) is never a sweep target, matching `scm_tick_clock`'s
    /// `round_robin` invariant of never landing on 0.
    fn sweep_one_zombie(&mut self) {
        let extra_clocks = self.local_obj_buffers.len().saturating_sub(1);
        let total = extra_clocks * 2;
        if total == 0 {
            return;
        }
        let idx = self.round_robin % total;
        self.round_robin = (self.round_robin + 1) % total;
        let clock = 1 + idx / 2;
        let current_time = self.current_time;
        if idx % 2 == 0 {
            let buf = &mut self.local_obj_buffers[clock];
            if buf.is_stale(current_time) && !buf.is_fully_drained() {
                buf.tick(&mut self.expired_objects);
            }
        } else {
            let buf = &mut self.local_reg_buffers[clock];
            if buf.is_stale(current_time) && !buf.is_fully_drained() {
                buf.tick(&mut self.expired_regions);
            }
        }
    }

    // ---- collection ----------------------------------------------------

    /// Reclaims one expired object and/or one expired region reference.
    /// Returns whether anything was collected.
    pub fn collect_step(&mut self) -> bool {
        let mut did_work = false;
        if let Some(header) = self.expired_objects.pop(&mut self.descriptor_page_pool) {
            Self::expire_object(header);
            did_work = true;
        }
        if let Some(encoded) = self.expired_regions.pop(&mut self.descriptor_page_pool) {
            let region_index = Self::decode_region_ref(encoded);
            self.expire_region_ref(region_index);
            did_work = true;
        }
        did_work
    }

    pub fn collect_all(&mut self) {
        while self.collect_step() {}
    }

    fn run_collection_policy(&mut self) {
        if config::EAGER_COLLECTION {
            self.collect_all();
        } else {
            self.collect_step();
        }
    }

    // ---- blocking ------------------------------------------------------

    pub fn block(&mut self) {
        if !self.blocked {
            global_clock::GLOBAL.block_thread();
            self.blocked = true;
        }
    }

    pub fn resume(&mut self) {
        if self.blocked {
            global_clock::GLOBAL.resume_thread();
            self.blocked = false;
        }
    }
}

fn clamp_extension(extension: u32) -> u32 {
    if extension > config::MAX_EXPIRATION_EXTENSION {
        log::debug!(
            "extension {} clamped to MAX_EXPIRATION_EXTENSION ({})",
            extension,
            config::MAX_EXPIRATION_EXTENSION
        );
        config::MAX_EXPIRATION_EXTENSION
    } else {
        extension
    }
}

static TERMINATED_ROOTS: Lazy<Mutex<Vec<Box<ThreadRoot>>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct TlsSlot(RefCell<Option<Box<ThreadRoot>>>);

impl Drop for TlsSlot {
    fn drop(&mut self) {
        if let Some(root) = self.0.borrow_mut().take() {
            global_clock::GLOBAL.unregister_thread();
            TERMINATED_ROOTS.lock().push(root);
        }
    }
}

thread_local! {
    static CURRENT: TlsSlot = TlsSlot(RefCell::new(None));
}

fn acquire() -> Box<ThreadRoot> {
    let phase = global_clock::GLOBAL.register_thread();
    let recycled = TERMINATED_ROOTS.lock().pop();
    match recycled {
        Some(root) => root.recycle(phase),
        None => Box::new(ThreadRoot::fresh(phase)),
    }
}

/// Runs `f` against the calling thread's root, lazily creating (or
/// recycling) one on first use.
pub fn with_current<R>(f: impl FnOnce(&mut ThreadRoot) -> R) -> R {
    CURRENT.with(|slot| {
        let mut guard = slot.0.borrow_mut();
        if guard.is_none() {
            *guard = Some(acquire());
        }
        f(guard.as_mut().unwrap())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister_clock_round_trips() {
        let mut root = ThreadRoot::fresh(1);
        let id = root.register_clock().unwrap();
        assert_ne!(id, 0);
        assert!(root.unregister_clock(id).is_ok());
        assert!(root.unregister_clock(0).is_err());
    }

    #[test]
    fn create_region_and_malloc() {
        let mut root = ThreadRoot::fresh(1);
        let region = root.create_region().unwrap();
        let p = root.malloc_in_region(region, 16).unwrap();
        assert!(!p.is_null());
    }

    #[test]
    fn tick_clock_requires_registered_clock() {
        let mut root = ThreadRoot::fresh(1);
        assert!(root.tick_clock(0).is_ok());
        assert!(matches!(root.tick_clock(2), Err(StmError::InvalidClock(2))));
    }

    #[test]
    fn recycle_bumps_time_and_frees_extra_clocks() {
        let root = Box::new(ThreadRoot::fresh(1));
        let mut recycled = root.recycle(5);
        assert_eq!(recycled.global_phase, 5);
        assert!(recycled.register_clock().is_ok());
    }

    #[test]
    fn ticking_does_not_advance_current_time_or_age_a_region() {
        let mut root = ThreadRoot::fresh(1);
        let region = root.create_region().unwrap();
        root.tick_clock(0).unwrap();
        root.tick_clock(0).unwrap();
        // A region created before any tick must still be allocatable and
        // must not have become reusable out from under its owner.
        assert!(!root.regions[region as usize].is_reusable(root.current_time));
        let p = root.malloc_in_region(region, 16).unwrap();
        assert!(!p.is_null());
    }

    #[test]
    fn sweep_never_selects_clock_zero() {
        let mut root = ThreadRoot::fresh(1);
        root.register_clock().unwrap();
        for _ in 0..8 {
            root.sweep_one_zombie();
        }
        assert!(!root.local_obj_buffers[0].is_stale(root.current_time));
    }

    #[test]
    fn register_clock_stamps_age_to_current_time() {
        let mut root = ThreadRoot::fresh(1);
        root.current_time = 7;
        let id = root.register_clock().unwrap();
        assert!(!root.local_obj_buffers[id].is_stale(7));
        assert!(!root.local_reg_buffers[id].is_stale(7));
    }

    #[test]
    fn refresh_object_with_invalid_clock_does_not_leak_the_counter() {
        let mut root = ThreadRoot::fresh(1);
        let header = Box::into_raw(Box::new(ObjectHeader::new_counter(0, -1)));
        assert!(root.refresh_object(header, ClockScope::Local(2), 1).is_ok());
        unsafe {
            assert_eq!((*header).tag(), crate::header::Tag::Counter(0), "an invalid clock must leave the counter untouched");
            drop(Box::from_raw(header));
        }
    }

    #[test]
    fn global_tick_advances_on_the_first_call() {
        let mut root = ThreadRoot::fresh(global_clock::GLOBAL.current_time());
        let phase_before = root.global_phase;
        root.global_tick();
        assert_ne!(root.global_phase, phase_before, "the first global_tick must not be a no-op");
    }
}
