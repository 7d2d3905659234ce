//! Process-wide finalizer registry. Mirrors `finalizer.h`/`finalizer.c`:
//! a bounded, append-only table of finalizer functions, referenced from an
//! object header by index rather than by raw function pointer so the
//! header stays a plain `i32`.
//!
//! A finalizer returning non-zero vetoes the free: the object is kept
//! alive (typically because the finalizer re-registered it, the same
//! convention `run_finalizer` follows in the C source).

use crate::config;
use crate::error::StmError;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// A finalizer callback: takes the expiring object's payload pointer,
/// returns non-zero to veto the free.
pub type FinalizerFn = fn(*mut u8) -> i32;

/// Sentinel `finalizer_index` meaning "no finalizer attached".
pub const NO_FINALIZER: i32 = -1;

static FINALIZERS: Lazy<Mutex<Vec<FinalizerFn>>> =
    Lazy::new(|| Mutex::new(Vec::with_capacity(config::FINALIZER_TABLE_SIZE)));

/// Registers a finalizer, returning the index to later pass to
/// `set_finalizer`/stash in an object header.
pub fn register_finalizer(f: FinalizerFn) -> Result<i32, StmError> {
    let mut table = FINALIZERS.lock();
    if table.len() >= config::FINALIZER_TABLE_SIZE {
        log::warn!("finalizer table full at {} entries", table.len());
        return Err(StmError::FinalizerTableFull);
    }
    table.push(f);
    Ok((table.len() - 1) as i32)
}

/// Runs the finalizer at `index` against `payload`, if any is registered.
/// Returns the finalizer's veto value, or `0` (no veto) when `index` is
/// [`NO_FINALIZER`] or out of range.
pub fn run_finalizer(index: i32, payload: *mut u8) -> i32 {
    if index == NO_FINALIZER {
        return 0;
    }
    let table = FINALIZERS.lock();
    match table.get(index as usize) {
        Some(f) => f(payload),
        None => {
            log::warn!("finalizer index {} out of range ({} registered)", index, table.len());
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    static CALLS: AtomicI32 = AtomicI32::new(0);

    fn counting_finalizer(_payload: *mut u8) -> i32 {
        CALLS.fetch_add(1, Ordering::SeqCst);
        0
    }

    fn vetoing_finalizer(_payload: *mut u8) -> i32 {
        1
    }

    #[test]
    fn no_finalizer_never_vetoes() {
        assert_eq!(run_finalizer(NO_FINALIZER, std::ptr::null_mut()), 0);
    }

    #[test]
    fn registered_finalizer_runs_and_can_veto() {
        let plain = register_finalizer(counting_finalizer).unwrap();
        let before = CALLS.load(Ordering::SeqCst);
        assert_eq!(run_finalizer(plain, std::ptr::null_mut()), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), before + 1);

        let vetoing = register_finalizer(vetoing_finalizer).unwrap();
        assert_eq!(run_finalizer(vetoing, std::ptr::null_mut()), 1);
    }
}
