//! Map persistence stream (§6 "Map persistence").
//!
//! `spec.md` calls the wire *format* out of scope ("Mentioned only as an
//! opaque stream") but the load/merge *operation* is not excluded by
//! either Non-goal, so it is implemented here against the grammar §6
//! gives verbatim:
//!
//! ```text
//! nanotube_map: <id> <type> <key_sz> <value_sz>
//! key: <bytes...> value: <bytes...>
//! ...
//! end
//! ```
//!
//! `#`-prefixed lines before the header are comments. Merge semantics
//! follow `original_source/libnt/base_map.cpp`: hash backends insert,
//! array backends write in place (`MapBackend::merge_entry`).

use std::io::{self, BufRead, Write};

use crate::map::MapBackend;

/// Parses hex-or-decimal byte lists written as whitespace-separated
/// `%02x` pairs (the only unambiguous textual byte encoding that survives
/// round-tripping through `dump`).
fn parse_bytes(s: &str) -> io::Result<Vec<u8>> {
    s.split_whitespace()
        .map(|tok| {
            u8::from_str_radix(tok, 16)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        })
        .collect()
}

fn format_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join(" ")
}

/// Loads entries from `reader` into `backend`, merging with whatever is
/// already present (§6: "If a map with that id already exists, entries
/// are merged").
pub fn load(reader: impl BufRead, backend: &dyn MapBackend) -> io::Result<()> {
    let mut lines = reader.lines();
    let mut saw_header = false;

    for line in &mut lines {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("nanotube_map:") {
            let fields: Vec<&str> = rest.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed nanotube_map header"));
            }
            saw_header = true;
            continue;
        }
        if !saw_header {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "entry before nanotube_map header"));
        }
        if line == "end" {
            break;
        }
        let Some(rest) = line.strip_prefix("key:") else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "expected 'key: ... value: ...'"));
        };
        let Some((key_part, value_part)) = rest.split_once("value:") else {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing 'value:'"));
        };
        let key = parse_bytes(key_part.trim())?;
        let value = parse_bytes(value_part.trim())?;
        backend.merge_entry(&key, &value);
    }
    Ok(())
}

/// Dumps every entry of `backend` in the §6 grammar.
pub fn dump(mut writer: impl Write, backend: &dyn MapBackend) -> io::Result<()> {
    writeln!(
        writer,
        "nanotube_map: {} {:?} {} {}",
        backend.id(),
        backend.map_type(),
        backend.key_length(),
        backend.value_length()
    )?;
    for (key, value) in backend.entries() {
        writeln!(writer, "key: {} value: {}", format_bytes(&key), format_bytes(&value))?;
    }
    writeln!(writer, "end")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::cam::CamMap;
    use crate::map::{MapOp, MapResult};
    use std::io::Cursor;

    #[test]
    fn dump_then_load_round_trips() {
        let src = CamMap::new(1, 2, 2, 4);
        let mask = [0xffu8];
        src.op(MapOp::Write, &[1, 0], Some(&[9, 9]), None, Some(&mask), 0, 2);

        let mut buf = Vec::new();
        dump(&mut buf, &src).unwrap();

        let dst = CamMap::new(1, 2, 2, 4);
        load(Cursor::new(buf), &dst).unwrap();

        let mut out = [0u8; 2];
        let (result, _) = dst.op(MapOp::Read, &[1, 0], None, Some(&mut out), None, 0, 2);
        assert_eq!(result, MapResult::Present);
        assert_eq!(out, [9, 9]);
    }
}
