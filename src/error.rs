//! Error taxonomy for the cases spec.md §7 calls out as distinguishable by
//! callers. The many "silent no-op" cases stay silent (`Option`/bare return)
//! per the spec; they are not represented here, only logged (see `api.rs`).

use thiserror::Error;

/// Errors surfaced by the public API where the spec gives the caller a
/// distinguishable failure rather than a silent no-op.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmError {
    /// `create_region` scanned the whole region table without finding a
    /// reusable slot.
    #[error("region contingency exceeded: all region slots are in use")]
    RegionTableFull,

    /// `register_clock` scanned the whole clock table without finding a
    /// reusable slot.
    #[error("clock contingency exceeded: all clock slots are in use")]
    ClockTableFull,

    /// `malloc_in_region` was asked for more bytes than fit in one region
    /// page's payload.
    #[error("requested size exceeds region page payload capacity")]
    RegionAllocationTooLarge,

    /// A region id was out of `[0, MAX_REGIONS)`.
    #[error("region index {0} is out of range")]
    InvalidRegion(i32),

    /// A clock id was out of `[0, MAX_CLOCKS)`.
    #[error("clock index {0} is out of range")]
    InvalidClock(i32),

    /// `register_finalizer` was called after the process-wide finalizer
    /// table filled up.
    #[error("finalizer table is full")]
    FinalizerTableFull,
}
