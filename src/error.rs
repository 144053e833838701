//! Reportable (non-fatal) failure modes.
//!
//! Programmer-contract violations are not represented here: they are
//! fatal and handled by the `fatal!` macro in the crate root. This enum
//! only covers §7's third failure kind, map-op rejections, which the
//! original reports as a plain zero return value; we give callers a
//! named reason instead while keeping the "0 bytes" observable behaviour
//! available via `MapRejection` matching.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("map operation rejected: {0}")]
    MapRejected(#[from] MapRejection),
}

/// Why `map_op_checked` rejected a request before it ever reached a
/// backend (§4.5, §7.3).
///
/// This only names the three reasons detectable generically at that
/// entry point (wrong key length, out-of-range offset/length, a missing
/// mask on a write-class op). Everything a concrete backend itself
/// rejects -- duplicate key for INSERT, absent key for UPDATE, a full
/// CAM on INSERT, an out-of-range ARRAY index -- collapses to the same
/// "zero bytes, `MapResult::Absent`" return `map_op` documents, exactly
/// as §7.3 describes the original: "Reported as a zero return value;
/// caller distinguishes by inspecting its expected byte count."
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapRejection {
    #[error("key length does not match the backend's key width")]
    KeyLengthMismatch,
    #[error("offset + length exceeds the value width")]
    OutOfRange,
    #[error("mask buffer missing for a write-class operation")]
    MissingMask,
}
