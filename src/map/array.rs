//! Fixed-capacity indexed-array map backend (§3.5, §4.5).
//!
//! The key is interpreted little-endian unsigned as a flat index; every
//! in-range index is always "present" (there is no separate occupied/
//! empty bit per slot), so `insert`/`remove` have no meaning here and are
//! programmer-contract violations, exactly as the original: "Array
//! backend semantics: ... `insert_empty` / `remove` are fatal errors."

use std::sync::Arc;

use crate::context::MapId;
use crate::fatal;
use crate::map::{apply_masked_write, MapBackend, MapOp, MapResult, MapType};

pub struct ArrayMap {
    id: MapId,
    key_length: usize,
    value_length: usize,
    capacity: usize,
    storage: spin::RwLock<Vec<u8>>,
}

impl ArrayMap {
    pub fn new(id: MapId, key_length: usize, value_length: usize, capacity: usize) -> Arc<Self> {
        assert!(key_length <= 8, "array map index must fit in a u64 key");
        Arc::new(ArrayMap {
            id,
            key_length,
            value_length,
            capacity,
            storage: spin::RwLock::new(vec![0u8; value_length * capacity]),
        })
    }

    fn index_of(&self, key: &[u8]) -> Option<usize> {
        if key.len() != self.key_length {
            return None;
        }
        let mut index: u64 = 0;
        for (i, &byte) in key.iter().enumerate() {
            index |= (byte as u64) << (8 * i);
        }
        let index = index as usize;
        (index < self.capacity).then_some(index)
    }
}

impl MapBackend for ArrayMap {
    fn id(&self) -> MapId {
        self.id
    }

    fn map_type(&self) -> MapType {
        MapType::Array
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
        let index = match self.index_of(key) {
            Some(i) => i,
            None => {
                if let Some(out) = data_out {
                    out.fill(0);
                }
                return (MapResult::Absent, 0);
            }
        };
        let base = index * self.value_length;
        let mut storage = self.storage.write();
        match op {
            MapOp::Nop => (MapResult::Absent, 0),
            MapOp::Read => {
                let out = data_out.expect("READ requires data_out");
                out.fill(0);
                out[..length].copy_from_slice(&storage[base + offset..base + offset + length]);
                (MapResult::Present, length)
            }
            MapOp::Write | MapOp::Update => {
                let data_in = data_in.expect("WRITE requires data_in");
                let mask = mask.expect("WRITE requires a mask (validated by map_op)");
                apply_masked_write(&mut storage[base..base + self.value_length], offset, length, data_in, mask);
                (MapResult::Present, length)
            }
            MapOp::Insert | MapOp::Remove => {
                fatal!("array map {}: insert/remove are not supported", self.id);
            }
        }
    }

    fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let storage = self.storage.read();
        (0..self.capacity)
            .map(|index| {
                let key = index.to_le_bytes()[..self.key_length].to_vec();
                let base = index * self.value_length;
                (key, storage[base..base + self.value_length].to_vec())
            })
            .collect()
    }

    fn merge_entry(&self, key: &[u8], value: &[u8]) {
        if let Some(index) = self.index_of(key) {
            let base = index * self.value_length;
            self.storage.write()[base..base + self.value_length].copy_from_slice(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_index_is_absent_with_zeroed_output() {
        let map = ArrayMap::new(1, 1, 4, 4);
        let key = [4u8];
        let mut out = [0xffu8; 4];
        let (result, n) = map.op(MapOp::Read, &key, None, Some(&mut out), None, 0, 4);
        assert_eq!(result, MapResult::Absent);
        assert_eq!(n, 0);
        assert_eq!(out, [0u8; 4]);
    }

    #[test]
    fn in_range_write_then_read() {
        let map = ArrayMap::new(1, 1, 4, 4);
        let key = [2u8];
        let mask = [0xffu8];
        map.op(MapOp::Write, &key, Some(&[9, 9, 9, 9]), None, Some(&mask), 0, 4);
        let mut out = [0u8; 4];
        map.op(MapOp::Read, &key, None, Some(&mut out), None, 0, 4);
        assert_eq!(out, [9, 9, 9, 9]);
    }
}
