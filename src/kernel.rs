//! Packet-kernel shims (§4.12, component L): the two ways a packet
//! enters and leaves the dataflow graph.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::Channel;
use crate::config::SIMPLE_BUS_DATA_BYTES;
use crate::idle::IdleWaiter;
use crate::packet::{BusKind, Packet};

/// What a function kernel reports back for one packet (§6 "Packet kernel
/// entry").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum KernelResult {
    Pass,
    Drop,
}

/// Wraps a user function `(context, packet) -> KernelResult`. `process`
/// converts the packet into the kernel's requested framing, calls the
/// function exactly once, converts back, and hands the result to the
/// caller (§4.12 "Function kernel").
pub struct FuncPacketKernel<F> {
    bus: Option<BusKind>,
    func: F,
}

impl<F> FuncPacketKernel<F>
where
    F: FnMut(&mut Packet) -> KernelResult,
{
    /// `bus = None` means the kernel is not capsule-aware and always
    /// sees a plain Ethernet packet.
    pub fn new(bus: Option<BusKind>, func: F) -> Self {
        FuncPacketKernel { bus, func }
    }

    pub fn process(&mut self, mut packet: Packet) -> (Packet, KernelResult) {
        let original_bus = packet.bus_kind();
        packet.convert_to(self.bus.unwrap_or(BusKind::Eth));
        let result = (self.func)(&mut packet);
        packet.convert_to(original_bus);
        (packet, result)
    }
}

/// Wraps the ingress/egress of the pipeline graph: `process` chops a
/// packet into bus words and writes them to the ingress channel;
/// `poll()` reads bus words from the egress channel and reassembles a
/// packet; `flush()` blocks (bounded by a timeout) until the graph goes
/// idle, polling the egress channel meanwhile (§4.12 "Channel kernel").
pub struct ChannelPacketKernel {
    ingress: Arc<Channel>,
    egress: Arc<Channel>,
    bus: BusKind,
    word_size: usize,
    idle: Arc<IdleWaiter>,
    partial_header_len: usize,
    assembling: Vec<u8>,
}

/// One bus word: up to `word_size` valid data bytes plus end-of-packet.
pub struct BusWord {
    pub data: Vec<u8>,
    pub valid_len: usize,
    pub eop: bool,
}

impl ChannelPacketKernel {
    pub fn new(ingress: Arc<Channel>, egress: Arc<Channel>, bus: BusKind, idle: Arc<IdleWaiter>) -> Self {
        ChannelPacketKernel {
            ingress,
            egress,
            bus,
            word_size: SIMPLE_BUS_DATA_BYTES,
            idle,
            partial_header_len: 0,
            assembling: Vec::new(),
        }
    }

    /// Chops `packet` into bus words (framed per `self.bus`) and writes
    /// each one to the ingress channel, blocking on backpressure.
    pub fn process(&mut self, mut packet: Packet) {
        packet.convert_to(self.bus);
        let (bytes, header_len) = packet.into_framed_bytes();
        self.partial_header_len = header_len;

        let mut offset = 0;
        while offset < bytes.len() || bytes.is_empty() {
            let end = (offset + self.word_size).min(bytes.len());
            let chunk = &bytes[offset..end];
            let eop = end == bytes.len();
            let word = encode_bus_word(chunk, self.word_size, eop);
            while !self.ingress.try_write(&word) {
                std::thread::yield_now();
            }
            offset = end;
            if bytes.is_empty() {
                break;
            }
        }
    }

    /// Reads as many bus words as are ready from the egress channel,
    /// reassembling at most one complete packet. Returns `None` if no
    /// complete packet is ready yet (§4.12: polling variant, no block).
    pub fn poll(&mut self, element_size: usize) -> Option<Packet> {
        loop {
            let mut raw = vec![0u8; element_size];
            if !self.egress.try_read(&mut raw) {
                return None;
            }
            let (data, valid_len, eop) = decode_bus_word(&raw, self.word_size);
            self.assembling.extend_from_slice(&data[..valid_len]);
            if eop {
                let bytes = std::mem::take(&mut self.assembling);
                let header_len = self.partial_header_len.min(bytes.len());
                return Some(Packet::from_framed_bytes(bytes, self.bus, header_len, 0));
            }
        }
    }

    /// Blocks, bounded by `timeout`, until `idle` reports the whole
    /// monitored graph quiescent, polling the egress channel meanwhile
    /// so a packet in flight when `flush` is called is not lost.
    pub fn flush(&mut self, element_size: usize, timeout: Duration) -> Vec<Packet> {
        let deadline = Instant::now() + timeout;
        let mut drained = Vec::new();
        loop {
            while let Some(packet) = self.poll(element_size) {
                drained.push(packet);
            }
            if self.idle.is_idle() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        drained
    }
}

/// Encodes a chunk of framed bytes as one simple-bus word: `word_size`
/// data bytes (zero-padded), one valid-length byte, one eop byte.
fn encode_bus_word(chunk: &[u8], word_size: usize, eop: bool) -> Vec<u8> {
    let mut word = vec![0u8; word_size + 2];
    word[..chunk.len()].copy_from_slice(chunk);
    word[word_size] = chunk.len() as u8;
    word[word_size + 1] = eop as u8;
    word
}

fn decode_bus_word(word: &[u8], word_size: usize) -> (Vec<u8>, usize, bool) {
    let valid_len = word[word_size] as usize;
    let eop = word[word_size + 1] != 0;
    (word[..word_size].to_vec(), valid_len, eop)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_kernel_round_trips_framing() {
        let mut kernel = FuncPacketKernel::new(Some(BusKind::Simple), |p: &mut Packet| {
            assert_eq!(p.bus_kind(), BusKind::Simple);
            KernelResult::Pass
        });
        let packet = Packet::from_eth(vec![1, 2, 3], 1);
        let (out, result) = kernel.process(packet);
        assert_eq!(result, KernelResult::Pass);
        assert_eq!(out.bus_kind(), BusKind::Eth);
        assert_eq!(out.body(), &[1, 2, 3]);
    }

    #[test]
    fn bus_word_round_trip() {
        let word = encode_bus_word(&[1, 2, 3], 8, true);
        let (data, valid_len, eop) = decode_bus_word(&word, 8);
        assert_eq!(valid_len, 3);
        assert!(eop);
        assert_eq!(&data[..3], &[1, 2, 3]);
    }
}
