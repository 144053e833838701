//! Packet-resize tap (§4.11, component J): deletes `delete_length`
//! bytes and inserts `insert_length` zero bytes at `write_offset`,
//! changing the packet's length.
//!
//! `original_source/libnt/nanotube_packet_taps_core.cpp` splits this tap
//! into an ingress half (computes a `control_word` describing how the
//! edit maps onto this word) and an egress half (replays the control
//! word against the raw bus words to produce the resized output),
//! because the hardware pipeline wants the rotate/classify work done in
//! one clock region and the final byte mux done in another. That split
//! has no observable effect on the output bytes -- §4.11.3's correctness
//! properties and the S5-S7 scenarios are stated purely in terms of the
//! transformed byte stream. This crate collapses the two halves into one
//! `resize_step` state machine; see `DESIGN.md` for why the split was
//! not reproduced.

/// Build-time (or per-packet) resize parameters. §4.11 treats these as
/// fixed for the duration of one packet, latched at the packet's first
/// word, the same way the write tap latches `write_offset`.
pub struct ResizeParams {
    pub write_offset: u64,
    pub delete_length: u64,
    pub insert_length: u64,
}

#[derive(Default)]
pub struct ResizeState {
    packet_offset: u64,
    carry: Vec<u8>,
    new_packet: bool,
}

impl ResizeState {
    pub fn new() -> Self {
        ResizeState { packet_offset: 0, carry: Vec::new(), new_packet: true }
    }
}

/// Feeds one input bus word through the resize transform. Returns the
/// output words produced by this call as `(bytes, eop)` pairs: zero when
/// the edit point has not been reached yet and nothing has accumulated
/// past a full `word_size`, one in the common case, and occasionally two
/// when a long `insert_length` or an end-of-packet flush produces more
/// than `word_size` bytes at once (the `push_1`/`push_2` case of
/// §4.11.2).
pub fn resize_step(
    state: &mut ResizeState,
    word: &[u8],
    word_len: usize,
    eop: bool,
    params: &ResizeParams,
    word_size: usize,
) -> Vec<(Vec<u8>, bool)> {
    if state.new_packet {
        state.packet_offset = 0;
        state.new_packet = false;
    }

    let start = state.packet_offset;
    for (i, &byte) in word.iter().enumerate().take(word_len) {
        let pos = start + i as u64;
        if pos == params.write_offset {
            state.carry.extend(std::iter::repeat(0u8).take(params.insert_length as usize));
        }
        let deleted = pos >= params.write_offset && pos < params.write_offset + params.delete_length;
        if !deleted {
            state.carry.push(byte);
        }
    }
    state.packet_offset = start + word_len as u64;

    let mut outputs = Vec::new();
    while state.carry.len() >= word_size {
        let chunk: Vec<u8> = state.carry.drain(..word_size).collect();
        outputs.push((chunk, false));
    }

    if eop {
        let rest: Vec<u8> = state.carry.drain(..).collect();
        outputs.push((rest, true));
        state.new_packet = true;
    }

    outputs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(packet: &[u8], word_size: usize, params: &ResizeParams) -> Vec<u8> {
        let mut state = ResizeState::new();
        let mut out = Vec::new();
        for (i, chunk) in packet.chunks(word_size).enumerate() {
            let eop = i * word_size + chunk.len() == packet.len();
            for (bytes, _) in resize_step(&mut state, chunk, chunk.len(), eop, params, word_size) {
                out.extend(bytes);
            }
        }
        out
    }

    #[test]
    fn pure_insert_scenario_s5() {
        let packet = [b'A', b'B', b'C', b'D'];
        let params = ResizeParams { write_offset: 2, delete_length: 0, insert_length: 3 };
        let out = run(&packet, 64, &params);
        assert_eq!(out, vec![b'A', b'B', 0, 0, 0, b'C', b'D']);
    }

    #[test]
    fn pure_delete_scenario_s6() {
        let packet = [b'A', b'B', b'C', b'D', b'E'];
        let params = ResizeParams { write_offset: 1, delete_length: 2, insert_length: 0 };
        let out = run(&packet, 64, &params);
        assert_eq!(out, vec![b'A', b'D', b'E']);
    }

    #[test]
    fn mixed_insert_delete_scenario_s7() {
        let packet = [b'A', b'B', b'C', b'D', b'E'];
        let params = ResizeParams { write_offset: 1, delete_length: 2, insert_length: 3 };
        let out = run(&packet, 64, &params);
        assert_eq!(out, vec![b'A', 0, 0, 0, b'D', b'E']);
    }

    #[test]
    fn edit_point_past_packet_end_is_a_no_op() {
        let packet = [b'A', b'B', b'C'];
        let params = ResizeParams { write_offset: 10, delete_length: 2, insert_length: 5 };
        let out = run(&packet, 64, &params);
        assert_eq!(out, packet.to_vec());
    }

    #[test]
    fn resize_crosses_word_boundaries() {
        // word_size = 2, packet = "ABCD", insert 3 zeros at offset 2.
        let packet = [b'A', b'B', b'C', b'D'];
        let params = ResizeParams { write_offset: 2, delete_length: 0, insert_length: 3 };
        let out = run(&packet, 2, &params);
        assert_eq!(out, vec![b'A', b'B', 0, 0, 0, b'C', b'D']);
    }
}
