//! Compile-time configuration. Mirrors the `#define SCM_*` knobs in
//! `libscm.h`: these are deliberately `const`s fixed at build time, not a
//! runtime-loaded config object, because changing them changes array sizes
//! embedded in `ThreadRoot` and `DescriptorBuffer`.

/// Size in bytes of a descriptor page. Must be a power of two and a
/// multiple of `size_of::<usize>()`.
pub const DESCRIPTOR_PAGE_SIZE: usize = 4096;

/// Size in bytes of a region page.
pub const REGION_PAGE_SIZE: usize = 4096;

/// Upper bound on the `extension` argument accepted by any `refresh` call.
pub const MAX_EXPIRATION_EXTENSION: u32 = 10;

/// Upper bound on the number of descriptor pages cached per thread.
pub const DESCRIPTOR_PAGE_FREELIST_SIZE: usize = 10;

/// Upper bound on the number of region pages cached per thread.
pub const REGION_PAGE_FREELIST_SIZE: usize = 10;

/// Number of region slots in a thread's region table.
pub const MAX_REGIONS: usize = 10;

/// Number of clock slots in a thread's clock table (slot 0 is the base clock).
pub const MAX_CLOCKS: usize = 10;

/// Capacity of the process-wide finalizer table.
pub const FINALIZER_TABLE_SIZE: usize = 32;

/// Number of descriptors that fit in one page: forward link and
/// descriptor count occupy two pointer-sized slots, the rest is back
/// references.
pub const fn descriptors_per_page() -> usize {
    (DESCRIPTOR_PAGE_SIZE - 2 * std::mem::size_of::<usize>()) / std::mem::size_of::<usize>()
}

/// Usable payload bytes in one region page, after the forward-link prefix.
pub const fn region_page_payload_size() -> usize {
    REGION_PAGE_SIZE - std::mem::size_of::<usize>()
}

/// Length of a locally-clocked descriptor buffer's `not_expired` array.
pub const fn local_buffer_length() -> usize {
    MAX_EXPIRATION_EXTENSION as usize + 1
}

/// Length of a globally-clocked descriptor buffer's `not_expired` array.
/// Two extra slots: one for "current time", one for the `+2` global slack.
pub const fn global_buffer_length() -> usize {
    MAX_EXPIRATION_EXTENSION as usize + 2
}

/// Whether collection drains the expired lists fully on every tick
/// (`eager-collection` feature) or performs one step per call (default,
/// matching `libscm`'s non-`SCM_EAGER_COLLECTION` build).
pub const EAGER_COLLECTION: bool = cfg!(feature = "eager-collection");

/// Checks an invariant the spec calls "fatal in debug builds, silent
/// no-op in release" (zombie clock/region misuse). Plain `debug_assert!`
/// already gives that behavior; the `check-conditions` feature escalates
/// it to a hard `assert!` in release too, matching `SCM_CHECK_CONDITIONS`
/// in the original C sources, which guards these checks independently of
/// the build's optimization level.
#[inline]
pub fn check_condition(cond: bool, msg: &str) {
    if cfg!(feature = "check-conditions") {
        assert!(cond, "{}", msg);
    } else {
        debug_assert!(cond, "{}", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_per_page_fits_the_page() {
        let d = descriptors_per_page();
        let used = 2 * std::mem::size_of::<usize>() + d * std::mem::size_of::<usize>();
        assert!(used <= DESCRIPTOR_PAGE_SIZE);
    }

    #[test]
    fn buffer_lengths_match_spec() {
        assert_eq!(local_buffer_length(), MAX_EXPIRATION_EXTENSION as usize + 1);
        assert_eq!(global_buffer_length(), MAX_EXPIRATION_EXTENSION as usize + 2);
    }
}
