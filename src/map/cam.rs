//! Content-addressable (hash) map backend (§3.5, §4.5).
//!
//! Keys are compared by exact byte equality (the `memcmp` semantics of
//! the original) and hashed with the documented rolling hash --
//! rotate-left-13 of the accumulator XOR'd with `d | (d << 17)` per key
//! byte -- plugged into `std::collections::HashMap` as a custom
//! `Hasher` rather than reimplementing open addressing by hand; the
//! spec only requires *some* non-cryptographic rolling hash, and
//! `HashMap<_, _, BuildHasherDefault<RollingHasher>>` is the idiomatic
//! way to swap a hash function into Rust's standard map.

use std::collections::HashMap;
use std::hash::{BuildHasherDefault, Hasher};
use std::sync::Arc;

use crate::context::MapId;
use crate::map::{apply_masked_write, MapBackend, MapOp, MapResult, MapType};

#[derive(Default)]
pub struct RollingHasher(u64);

impl Hasher for RollingHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &d in bytes {
            self.0 = self.0.rotate_left(13) ^ (d as u64 | ((d as u64) << 17));
        }
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

type RollingMap = HashMap<Vec<u8>, Vec<u8>, BuildHasherDefault<RollingHasher>>;

pub struct CamMap {
    id: MapId,
    key_length: usize,
    value_length: usize,
    capacity: usize,
    storage: spin::RwLock<RollingMap>,
}

impl CamMap {
    pub fn new(id: MapId, key_length: usize, value_length: usize, capacity: usize) -> Arc<Self> {
        Arc::new(CamMap {
            id,
            key_length,
            value_length,
            capacity,
            storage: spin::RwLock::new(RollingMap::default()),
        })
    }
}

impl MapBackend for CamMap {
    fn id(&self) -> MapId {
        self.id
    }

    fn map_type(&self) -> MapType {
        MapType::Cam
    }

    fn key_length(&self) -> usize {
        self.key_length
    }

    fn value_length(&self) -> usize {
        self.value_length
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn op(
        &self,
        op: MapOp,
        key: &[u8],
        data_in: Option<&[u8]>,
        data_out: Option<&mut [u8]>,
        mask: Option<&[u8]>,
        offset: usize,
        length: usize,
    ) -> (MapResult, usize) {
        let mut storage = self.storage.write();
        match op {
            MapOp::Nop => (MapResult::Absent, 0),
            MapOp::Read => {
                let out = data_out.expect("READ requires data_out");
                out.fill(0);
                match storage.get(key) {
                    Some(value) => {
                        let n = length.min(value.len().saturating_sub(offset));
                        out[..n].copy_from_slice(&value[offset..offset + n]);
                        (MapResult::Present, n)
                    }
                    None => (MapResult::Absent, 0),
                }
            }
            MapOp::Write | MapOp::Insert | MapOp::Update => {
                let present = storage.contains_key(key);
                if op == MapOp::Insert && present {
                    return (MapResult::Present, 0);
                }
                if op == MapOp::Update && !present {
                    return (MapResult::Absent, 0);
                }
                if !present && storage.len() >= self.capacity {
                    return (MapResult::Absent, 0);
                }
                let value = storage
                    .entry(key.to_vec())
                    .or_insert_with(|| vec![0u8; self.value_length]);
                let data_in = data_in.expect("WRITE requires data_in");
                let mask = mask.expect("WRITE requires a mask (validated by map_op)");
                apply_masked_write(value, offset, length, data_in, mask);
                let result = if present { MapResult::Present } else { MapResult::Absent };
                (result, length)
            }
            MapOp::Remove => match storage.remove(key) {
                Some(_) => (MapResult::Present, usize::MAX),
                None => (MapResult::Absent, 0),
            },
        }
    }

    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.storage
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn merge_entry(&self, key: &[u8], value: &[u8]) {
        self.storage.write().insert(key.to_vec(), value.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let map = CamMap::new(1, 4, 16, 4);
        let key = 0xDEADBEEFu32.to_le_bytes();
        let data = [7u8; 16];
        let mask = [0xffu8; 2];
        let (result, n) = map.op(MapOp::Write, &key, Some(&data), None, Some(&mask), 0, 16);
        assert_eq!(result, MapResult::Absent);
        assert_eq!(n, 16);

        let mut out = [0u8; 16];
        let (result, n) = map.op(MapOp::Read, &key, None, Some(&mut out), None, 0, 16);
        assert_eq!(result, MapResult::Present);
        assert_eq!(n, 16);
        assert_eq!(out, data);
    }

    #[test]
    fn insert_rejects_duplicate_key() {
        let map = CamMap::new(1, 2, 2, 2);
        let key = [1u8, 0];
        let mask = [0xffu8];
        map.op(MapOp::Insert, &key, Some(&[9, 9]), None, Some(&mask), 0, 2);
        let (result, n) = map.op(MapOp::Insert, &key, Some(&[1, 1]), None, Some(&mask), 0, 2);
        assert_eq!(result, MapResult::Present);
        assert_eq!(n, 0);
    }
}
