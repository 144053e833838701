//! Packet length/read/write taps (§4.7-§4.9, components G/H/I).
//!
//! Each tap is a small state machine driven one bus word at a time. All
//! three share the "done" latch that suppresses a second valid response
//! within the same packet (grounded in
//! `original_source/libnt/nanotube_packet_taps_core.cpp`'s per-tap
//! `m_done` flag) and all reset their state on end-of-packet.

use crate::packet::rotate::{classify, rotate_down, rotate_mask_down, ByteClass};

/// §4.7: reports the packet's total length once known (at end-of-packet,
/// or earlier if a `max_length` cap is hit).
#[derive(Default)]
pub struct LengthTapState {
    packet_offset: u32,
    done: bool,
}

pub struct LengthTapRequest {
    pub valid: bool,
    pub max_length: u32,
}

pub struct LengthTapResponse {
    pub valid: bool,
    pub result_length: u32,
}

pub fn length_tap(
    state: &mut LengthTapState,
    word_valid_len: u32,
    eop: bool,
    req: &LengthTapRequest,
) -> LengthTapResponse {
    let offset = state.packet_offset;
    let new_offset = offset + word_valid_len;
    let cap_hit = req.valid && new_offset >= req.max_length;
    let valid = (eop || cap_hit) && !state.done;
    let result_length = if cap_hit { req.max_length.min(new_offset) } else { new_offset };

    if valid {
        state.done = true;
    }
    if eop {
        state.packet_offset = 0;
        state.done = false;
    } else {
        state.packet_offset = new_offset;
    }

    LengthTapResponse { valid, result_length }
}

/// §4.8: copies up to `RB` bytes (`result.len()`) starting at
/// `read_offset` into `result`. `result` is caller-owned and persists
/// across calls within one packet: bytes outside the `[result_start,
/// result_end)` window for this word are left untouched (`Before`) or
/// zeroed once the read has moved past them for good (`After`), matching
/// the BEFORE/IN/AFTER split of §4.10.
#[derive(Default)]
pub struct ReadTapState {
    packet_offset: u32,
    /// Latched from the first word of the read and reused unchanged for
    /// every later word of the same read (`nanotube_tap_packet_read_core`
    /// only computes this once).
    rot_amount: usize,
    result_offset: u32,
    done: bool,
}

pub struct ReadTapRequest {
    pub valid: bool,
    pub read_offset: u32,
    pub read_length: u32,
}

pub struct ReadTapResponse {
    pub valid: bool,
    pub result_length: u32,
}

pub fn read_tap(
    state: &mut ReadTapState,
    word: &[u8],
    word_len: usize,
    eop: bool,
    req: &ReadTapRequest,
    result: &mut [u8],
) -> ReadTapResponse {
    let word_start = state.packet_offset;
    let word_end = word_start + word_len as u32;
    state.packet_offset = if eop { 0 } else { word_end };

    let started = req.valid && req.read_offset < word_end;
    let first_word = started && req.read_offset >= word_start;
    if first_word {
        state.rot_amount = (req.read_offset - word_start) as usize;
    }
    let rot_len = word_len.max(1);
    let rotated = rotate_down(rot_len, rot_len, word, state.rot_amount);

    // First word of the read contributes only its tail from `read_offset`
    // onward; every later word of the same read contributes in full --
    // the read_length/RB clamp below, not this, is what ends the read.
    let max_frag_length: u32 = if !started {
        0
    } else if first_word {
        word_end - req.read_offset
    } else {
        word_len as u32
    };

    let result_start = state.result_offset;
    let result_end = (result_start + max_frag_length).min(req.read_length);

    let rb = result.len();
    for (i, class) in classify(rb, result_start as usize, result_end as usize).into_iter().enumerate() {
        // `i` is the absolute position in `result`, not relative to this
        // word's fragment; indexing `rotated` by `i % rot_len` is what
        // lines each word's contribution up with the right slice of its
        // own rotated bytes (`nanotube_tap_packet_read_core`'s
        // `rot_buffer[index % rot_len]`).
        if class == ByteClass::In {
            result[i] = rotated[i % rot_len];
        }
    }

    let reached_length = req.valid && result_end >= req.read_length;
    let is_done_now = reached_length || eop;
    let valid = is_done_now && !state.done;

    state.result_offset = if eop || !started { 0 } else { result_start + max_frag_length };
    state.done = if eop { false } else { is_done_now };
    if eop {
        state.rot_amount = 0;
    }

    ReadTapResponse { valid, result_length: result_end }
}

/// §4.9: overlays up to `RB` request bytes (`req.data`), gated by a
/// per-byte mask, onto a contiguous `[write_offset, write_offset +
/// write_length)` region of the packet, in place.
#[derive(Default)]
pub struct WriteTapState {
    packet_offset: u32,
    rot_amount: usize,
}

pub struct WriteTapRequest<'a> {
    pub valid: bool,
    pub write_offset: u32,
    pub write_length: u32,
    pub data: &'a [u8],
    pub mask: &'a [u8],
}

pub fn write_tap(state: &mut WriteTapState, word: &mut [u8], word_len: usize, eop: bool, req: &WriteTapRequest) {
    let word_start = state.packet_offset;
    let word_end = word_start + word_len as u32;

    let first_word = req.valid && req.write_offset >= word_start && req.write_offset < word_end;
    let rb = req.data.len();
    let rot_buf_len = rb.next_power_of_two().max(word_len).max(1);

    if first_word {
        let into_word = (req.write_offset - word_start) as usize;
        state.rot_amount = (rot_buf_len - into_word % rot_buf_len) % rot_buf_len;
    } else if !req.valid {
        state.rot_amount = 0;
    } else {
        state.rot_amount = (state.rot_amount + word_len) % rot_buf_len;
    }

    if !req.valid {
        state.packet_offset = if eop { 0 } else { word_end };
        return;
    }

    let frag_start = req.write_offset.max(word_start);
    let frag_end = (req.write_offset + req.write_length).min(word_end).max(frag_start);
    let frag_start_off = (frag_start - word_start) as usize;
    let frag_end_off = (frag_end - word_start) as usize;

    let rotated_data = rotate_down(word_len, rot_buf_len, req.data, state.rot_amount);
    let rotated_mask = rotate_mask_down(req.mask, rb.max(1), state.rot_amount % rb.max(1), word_len);

    for (i, class) in classify(word_len, frag_start_off, frag_end_off).into_iter().enumerate() {
        if class == ByteClass::In {
            let bit_set = (rotated_mask[i / 8] >> (i % 8)) & 1 != 0;
            if bit_set {
                word[i] = rotated_data[i];
            }
        }
    }

    state.packet_offset = if eop { 0 } else { word_end };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_tap_reports_at_eop() {
        let mut state = LengthTapState::default();
        let req = LengthTapRequest { valid: false, max_length: 0 };
        let r1 = length_tap(&mut state, 64, false, &req);
        assert!(!r1.valid);
        let r2 = length_tap(&mut state, 40, true, &req);
        assert!(r2.valid);
        assert_eq!(r2.result_length, 104);
    }

    #[test]
    fn length_tap_caps_at_max_length() {
        let mut state = LengthTapState::default();
        let req = LengthTapRequest { valid: true, max_length: 50 };
        let r1 = length_tap(&mut state, 64, false, &req);
        assert!(r1.valid);
        assert_eq!(r1.result_length, 50);
        // Suppressed until the next packet.
        let r2 = length_tap(&mut state, 10, false, &req);
        assert!(!r2.valid);
    }

    #[test]
    fn read_tap_crosses_word_boundary() {
        // 200-byte packet in 64-byte words, read(offset=58, length=12).
        let packet: Vec<u8> = (0..200u32).map(|i| (i % 256) as u8).collect();
        let mut state = ReadTapState::default();
        let req = ReadTapRequest { valid: true, read_offset: 58, read_length: 12 };
        let mut result = vec![0xffu8; 12];

        let word0 = &packet[0..64];
        let resp0 = read_tap(&mut state, word0, 64, false, &req, &mut result);
        // Only 6 of the 12 requested bytes (58..64) live in word0; the read
        // can't be done yet, and the tail of `result` is untouched.
        assert!(!resp0.valid);
        assert_eq!(resp0.result_length, 6);
        assert_eq!(&result[0..6], &packet[58..64]);
        assert_eq!(&result[6..12], &[0xff; 6]);

        let word1 = &packet[64..128];
        let resp1 = read_tap(&mut state, word1, 64, false, &req, &mut result);
        assert!(resp1.valid);
        assert_eq!(resp1.result_length, 12);
        assert_eq!(result, packet[58..70]);
    }

    #[test]
    fn write_tap_overlays_masked_region() {
        let mut word = [0u8; 8];
        let mut state = WriteTapState::default();
        let data = [1, 2, 3, 4];
        let mask = [0b0000_1010]; // only bytes 1 and 3 of `data` apply
        let req = WriteTapRequest { valid: true, write_offset: 2, write_length: 4, data: &data, mask: &mask };
        write_tap(&mut state, &mut word, 8, true, &req);
        assert_eq!(word, [0, 0, 0, 2, 0, 4, 0, 0]);
    }
}
