//! Associative-store backends (§3.5, §4.5) and the multi-client arbiter
//! built on top of them (§3.6, §4.6).

pub mod arbiter;
pub mod array;
pub mod cam;
pub mod persist;

use crate::context::MapId;
use crate::error::MapRejection;

/// The five operations a client may request plus the always-succeeding
/// `Nop` (§4.5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapOp {
    Nop,
    Read,
    Write,
    Insert,
    Update,
    Remove,
}

/// Whether the key was present going into the operation. Scenarios S8/S9
/// name this `PRESENT`/`ABSENT`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapResult {
    Absent,
    Present,
}

/// What kind of backend a map is (used by `nanotube_map_op`'s dispatch and
/// by the persistence format's `<type>` field).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapType {
    Cam,
    Array,
}

/// A sum-type-hidden-behind-an-interface backend (§9: "make the backend a
/// sum type `{ Cam, Array }` hidden behind a small interface; the arbiter
/// thread is the sole owner and uses `&mut` access without locking").
///
/// The interior locking seen here (`spin::RwLock` in the concrete
/// backends) exists only because the backend is reachable both from the
/// arbiter's service thread and, before the graph starts, from
/// `Context::add_map`/setup code; once the graph is running only the
/// arbiter thread ever calls `op`, matching the "sole owner" note.
pub trait MapBackend: Send + Sync {
    fn id(&self) -> MapId;
    fn map_type(&self) -> MapType;
    fn key_length(&self) -> usize;
    fn value_length(&self) -> usize;
    fn capacity(&self) -> usize;

    /// The unified `map_op` from §4.5.
    ///
    /// Returns `(result, copied_or_written_length)`. `REMOVE` reports a
    /// successful removal as `usize::MAX` per §4.5 ("remove and return
    /// `SIZE_MAX`"); all other operations report the number of bytes
    /// copied into `data_out` (`READ`) or written into the value
    /// (`WRITE`/`INSERT`/`UPDATE`), or `0` on rejection.
    #[allow(clippy::too_many_arguments)]
    fn op(
        &self,
        op: MapOp,
        key: &[u8],
        data_in: Option<&[u8]>,
        data_out: Option<&mut [u8]>,
        mask: Option<&[u8]>,
        offset: usize,
        length: usize,
    ) -> (MapResult, usize);

    /// For the persistence format (§6): iterate `(key, value)` pairs.
    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)>;

    /// For the persistence format's merge rule: hash backends insert,
    /// array backends write in place (`original_source/libnt/base_map.cpp`).
    fn merge_entry(&self, key: &[u8], value: &[u8]);
}

/// Applies the masked byte-level overlay shared by `WRITE`/`INSERT`/
/// `UPDATE` (§4.5): `value[offset + i] = data_in[i]` for each `i` whose
/// mask bit is set.
pub(crate) fn apply_masked_write(value: &mut [u8], offset: usize, length: usize, data_in: &[u8], mask: &[u8]) {
    for i in 0..length {
        let bit_set = (mask[i / 8] >> (i % 8)) & 1 != 0;
        if bit_set {
            value[offset + i] = data_in[i];
        }
    }
}

/// The unified `map_op(ctx, id, op, key, data_in?, data_out?, mask?,
/// offset, length)` entry point from §4.5. Performs the checks common to
/// every backend -- wrong key length, out-of-range `offset`/`length`,
/// missing mask on a write-class op -- before delegating to
/// `MapBackend::op`; §9's "possibly-buggy source behaviour" note about
/// `data_out` zeroing on a non-`READ` miss is resolved here by always
/// requiring `READ` to go through the `Read` arm (no mixed read-on-write).
#[allow(clippy::too_many_arguments)]
pub fn map_op(
    backend: &dyn MapBackend,
    op: MapOp,
    key: &[u8],
    data_in: Option<&[u8]>,
    data_out: Option<&mut [u8]>,
    mask: Option<&[u8]>,
    offset: usize,
    length: usize,
) -> (MapResult, usize) {
    if op == MapOp::Nop {
        return (MapResult::Absent, 0);
    }
    if key.len() != backend.key_length() {
        if let Some(out) = data_out {
            out.fill(0);
        }
        return (MapResult::Absent, 0);
    }
    if offset.checked_add(length).map_or(true, |end| end > backend.value_length()) {
        if let Some(out) = data_out {
            out.fill(0);
        }
        return (MapResult::Absent, 0);
    }
    if matches!(op, MapOp::Write | MapOp::Insert | MapOp::Update) && (mask.is_none() || data_in.is_none()) {
        return (MapResult::Absent, 0);
    }
    backend.op(op, key, data_in, data_out, mask, offset, length)
}

/// A typed-error convenience wrapper over `map_op` for callers that want
/// `Result` rather than a bare zero-length return.
///
/// §7.3 reports every map-op rejection the same way regardless of
/// cause -- a zero return value -- and the backend's own `op` doesn't
/// distinguish "absent key" from "backend full" in its return type
/// either, so only the three rejection reasons this entry point can
/// itself detect (wrong key length, out-of-range offset/length, missing
/// mask on a write-class op) are named here; anything the backend
/// itself rejects still surfaces as `Ok((MapResult::Absent, 0))`, exactly
/// the tuple-based behaviour `map_op` documents.
#[allow(clippy::too_many_arguments)]
pub fn map_op_checked(
    backend: &dyn MapBackend,
    op: MapOp,
    key: &[u8],
    data_in: Option<&[u8]>,
    data_out: Option<&mut [u8]>,
    mask: Option<&[u8]>,
    offset: usize,
    length: usize,
) -> Result<(MapResult, usize), MapRejection> {
    if op != MapOp::Nop && key.len() != backend.key_length() {
        return Err(MapRejection::KeyLengthMismatch);
    }
    if offset.checked_add(length).map_or(true, |end| end > backend.value_length()) {
        return Err(MapRejection::OutOfRange);
    }
    if matches!(op, MapOp::Write | MapOp::Insert | MapOp::Update) && (mask.is_none() || data_in.is_none()) {
        return Err(MapRejection::MissingMask);
    }
    Ok(map_op(backend, op, key, data_in, data_out, mask, offset, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::cam::CamMap;

    #[test]
    fn checked_rejects_wrong_key_length() {
        let backend = CamMap::new(1, 4, 4, 4);
        let err = map_op_checked(backend.as_ref(), MapOp::Read, &[1, 2], None, None, None, 0, 4).unwrap_err();
        assert_eq!(err, MapRejection::KeyLengthMismatch);
    }

    #[test]
    fn checked_rejects_out_of_range_offset() {
        let backend = CamMap::new(1, 4, 4, 4);
        let key = [0u8; 4];
        let err = map_op_checked(backend.as_ref(), MapOp::Read, &key, None, None, None, 2, 4).unwrap_err();
        assert_eq!(err, MapRejection::OutOfRange);
    }

    #[test]
    fn checked_rejects_missing_mask_on_write() {
        let backend = CamMap::new(1, 4, 4, 4);
        let key = [0u8; 4];
        let data = [0u8; 4];
        let err = map_op_checked(backend.as_ref(), MapOp::Write, &key, Some(&data), None, None, 0, 4).unwrap_err();
        assert_eq!(err, MapRejection::MissingMask);
    }

    #[test]
    fn checked_forwards_successful_op() {
        let backend = CamMap::new(1, 4, 4, 4);
        let key = [0u8; 4];
        let data = [7u8; 4];
        let mask = [0xffu8];
        let (result, n) =
            map_op_checked(backend.as_ref(), MapOp::Write, &key, Some(&data), None, Some(&mask), 0, 4).unwrap();
        assert_eq!(result, MapResult::Absent);
        assert_eq!(n, 4);
    }
}
