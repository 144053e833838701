//! Lock-free SPSC ring of fixed-size elements (§3.1, §4.1).
//!
//! Mirrors the index encoding and the sleep/wake race argument of the
//! original `nanotube_channel`: indices are a byte offset packed with a
//! one-bit wrap parity in the top bit, `try_read`/`try_write` use
//! sequentially-consistent ops on the index and the wait-flags so that
//! a peer which misses our index update is guaranteed to observe our
//! wait flag (see the module-level contract note below), and a
//! successful operation always clears the peer's wait flag and wakes it.
//!
//! The cached-index / reserve-commit style of `count_free`/`reserve`/
//! `cancel`/`submit` in the teacher's `xsk/ring.rs` is not reused
//! verbatim here: that crate amortises index loads across a *batch* of
//! ring slots (suited to packet sockets processing many descriptors per
//! syscall), while this channel is a byte-queue driven one element at a
//! time by `try_read`/`try_write`, exactly as specified. What is kept is
//! the producer/consumer split (one side only ever writes the read index,
//! the other only the write index) and the atomic-ordering discipline.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{RwLock, Weak};

use crate::context::Context;
use crate::fatal;

bitflags::bitflags! {
    /// Which side is blocked waiting for the other to make progress.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct WaitFlags: u8 {
        const READER_WAITING = 0b01;
        const WRITER_WAITING = 0b10;
    }
}

/// The top bit of `usize` is the wrap parity; the rest encodes the byte
/// offset into the ring (§3.1: "the low bits ... are the byte offset
/// ... the top bit is a wrap parity").
const WRAP_BIT: usize = !(usize::MAX >> 1);
const OFFSET_MASK: usize = !WRAP_BIT;

#[inline]
fn offset_of(index: usize) -> usize {
    index & OFFSET_MASK
}

#[inline]
fn wrap_of(index: usize) -> usize {
    index & WRAP_BIT
}

/// Direction under which a context may register for a channel (§3.4, §4.4).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Direction {
    Read,
    Write,
}

/// A bounded single-producer/single-consumer queue of `element_size`-byte
/// elements.
pub struct Channel {
    name: String,
    element_size: usize,
    capacity: usize,
    bytes: UnsafeCell<Box<[u8]>>,
    read_index: AtomicUsize,
    write_index: AtomicUsize,
    wait_flags: AtomicU8,
    reader: RwLock<Option<Weak<Context>>>,
    writer: RwLock<Option<Weak<Context>>>,
}

// Safety: `bytes` is only ever touched through the offset owned by
// whichever side's index currently governs it; the read and write
// regions never overlap because the index advance is what publishes a
// slot from one side to the other (see `try_read`/`try_write`).
unsafe impl Sync for Channel {}
unsafe impl Send for Channel {}

impl Channel {
    /// Creates a channel holding up to `capacity` elements of
    /// `element_size` bytes each.
    pub fn new(name: impl Into<String>, element_size: usize, capacity: usize) -> Self {
        assert!(element_size > 0, "channel element size must be non-zero");
        assert!(capacity > 0, "channel capacity must be non-zero");
        let total = element_size
            .checked_mul(capacity)
            .expect("channel byte length overflow");
        assert!(total <= OFFSET_MASK, "channel too large to index");
        Channel {
            name: name.into(),
            element_size,
            capacity,
            bytes: UnsafeCell::new(vec![0u8; total].into_boxed_slice()),
            read_index: AtomicUsize::new(0),
            write_index: AtomicUsize::new(0),
            wait_flags: AtomicU8::new(0),
            reader: RwLock::new(None),
            writer: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Called by `Context::add_channel` (§4.4). Fatal if the role is
    /// already taken, matching the "Duplicates fail" contract.
    pub(crate) fn set_reader(&self, ctx: Weak<Context>) {
        let mut slot = self.reader.write().unwrap();
        if slot.is_some() {
            fatal!("channel '{}': reader already registered", self.name);
        }
        *slot = Some(ctx);
    }

    pub(crate) fn set_writer(&self, ctx: Weak<Context>) {
        let mut slot = self.writer.write().unwrap();
        if slot.is_some() {
            fatal!("channel '{}': writer already registered", self.name);
        }
        *slot = Some(ctx);
    }

    fn byte_len(&self) -> usize {
        self.element_size * self.capacity
    }

    fn advance(&self, index: usize) -> usize {
        let next_offset = offset_of(index) + self.element_size;
        if next_offset >= self.byte_len() {
            (next_offset - self.byte_len()) | (wrap_of(index) ^ WRAP_BIT)
        } else {
            next_offset | wrap_of(index)
        }
    }

    fn is_full(read_index: usize, write_index: usize) -> bool {
        read_index == (write_index ^ WRAP_BIT)
    }

    fn is_empty(read_index: usize, write_index: usize) -> bool {
        read_index == write_index
    }

    /// §4.1: "Returns `true` iff the ring is not full. Side-effect: if
    /// full and the writer wait-flag is clear, sets it atomically;
    /// re-checks the read index in case a concurrent read freed space."
    pub fn has_space(&self) -> bool {
        let write_index = self.write_index.load(Ordering::SeqCst);
        let read_index = self.read_index.load(Ordering::SeqCst);
        if !Self::is_full(read_index, write_index) {
            return true;
        }
        self.set_wait_flag(WaitFlags::WRITER_WAITING);
        let read_index = self.read_index.load(Ordering::SeqCst);
        !Self::is_full(read_index, write_index)
    }

    /// Symmetric to `has_space` from the reader's perspective.
    pub fn has_data(&self) -> bool {
        let read_index = self.read_index.load(Ordering::SeqCst);
        let write_index = self.write_index.load(Ordering::SeqCst);
        if !Self::is_empty(read_index, write_index) {
            return true;
        }
        self.set_wait_flag(WaitFlags::READER_WAITING);
        let write_index = self.write_index.load(Ordering::SeqCst);
        !Self::is_empty(read_index, write_index)
    }

    fn set_wait_flag(&self, flag: WaitFlags) {
        let mut flags = self.wait_flags.load(Ordering::SeqCst);
        loop {
            if flags & flag.bits() != 0 {
                return;
            }
            match self.wait_flags.compare_exchange(
                flags,
                flags | flag.bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => flags = observed,
            }
        }
    }

    /// §4.1 writer operation. Pre: `data.len() == element_size` and the
    /// caller is running on the writer context's thread -- enforced via
    /// `check_role`, fatal on mismatch, since violating single-writer
    /// discipline is a programmer error, not a reportable failure (§7.1,
    /// §8 invariant 3).
    pub fn try_write(&self, data: &[u8]) -> bool {
        debug_assert_eq!(data.len(), self.element_size, "element size mismatch");
        self.check_role(&self.writer, "writer");
        if !self.has_space() {
            return false;
        }
        let write_index = self.write_index.load(Ordering::Relaxed);
        let off = offset_of(write_index);
        // Safety: the writer is the sole owner of the slot at `off` until
        // the index advance below publishes it to the reader.
        unsafe {
            let buf = &mut *self.bytes.get();
            buf[off..off + self.element_size].copy_from_slice(data);
        }
        let next = self.advance(write_index);
        self.write_index.store(next, Ordering::SeqCst);
        let previous_flags = WaitFlags::from_bits_truncate(self.wait_flags.swap(0, Ordering::SeqCst));
        if previous_flags.contains(WaitFlags::READER_WAITING) {
            self.wake(&self.reader);
        }
        true
    }

    /// §4.1 reader operation. Pre: the caller is running on the reader
    /// context's thread -- enforced via `check_role`, fatal on mismatch
    /// (§8 invariant 3). On failure (empty ring) `data` is zero-filled,
    /// matching "zero-fills the destination and returns false".
    pub fn try_read(&self, data: &mut [u8]) -> bool {
        debug_assert_eq!(data.len(), self.element_size, "element size mismatch");
        self.check_role(&self.reader, "reader");
        if !self.has_data() {
            data.fill(0);
            return false;
        }
        let read_index = self.read_index.load(Ordering::Relaxed);
        let off = offset_of(read_index);
        // Safety: symmetric to `try_write`; the slot at `off` was
        // published by the writer's index advance before we observed it
        // via `has_data`.
        unsafe {
            let buf = &*self.bytes.get();
            data.copy_from_slice(&buf[off..off + self.element_size]);
        }
        let next = self.advance(read_index);
        self.read_index.store(next, Ordering::SeqCst);
        let previous_flags = WaitFlags::from_bits_truncate(self.wait_flags.swap(0, Ordering::SeqCst));
        if previous_flags.contains(WaitFlags::WRITER_WAITING) {
            self.wake(&self.writer);
        }
        true
    }

    fn wake(&self, side: &RwLock<Option<Weak<Context>>>) {
        if let Some(ctx) = side.read().unwrap().as_ref().and_then(Weak::upgrade) {
            ctx.wake();
        }
    }

    /// §4.1 precondition / §8 invariant 3: the calling OS thread must be
    /// the one bound to whichever context registered for `side`. Fatal on
    /// mismatch or if nobody has registered yet, via
    /// `Context::check_thread` (§4.4).
    fn check_role(&self, side: &RwLock<Option<Weak<Context>>>, role: &str) {
        match side.read().unwrap().as_ref().and_then(Weak::upgrade) {
            Some(ctx) => ctx.check_thread(),
            None => fatal!("channel '{}': no {} registered", self.name, role),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ChannelFlags;
    use crate::thread::Thread;
    use std::sync::Arc;

    /// Registers `ch` as both read and written by a context bound to the
    /// current (test harness) thread, so `try_read`/`try_write`'s
    /// thread-identity check passes.
    fn register_loopback(ch: &Arc<Channel>) {
        let ctx = Context::new("t");
        let thread = Thread::new("t");
        thread.bind_current_for_test();
        ctx.bind_thread(Arc::clone(&thread));
        ctx.add_channel(0, Arc::clone(ch), ChannelFlags::READ | ChannelFlags::WRITE);
    }

    #[test]
    fn empty_read_zero_fills_and_fails() {
        let ch = Arc::new(Channel::new("t", 4, 2));
        register_loopback(&ch);
        let mut out = [0xffu8; 4];
        assert!(!ch.try_read(&mut out));
        assert_eq!(out, [0u8; 4]);
    }

    #[test]
    fn fifo_order_is_preserved() {
        let ch = Arc::new(Channel::new("t", 4, 2));
        register_loopback(&ch);
        assert!(ch.try_write(&[1, 2, 3, 4]));
        assert!(ch.try_write(&[5, 6, 7, 8]));
        // Full: capacity 2, both slots occupied.
        assert!(!ch.try_write(&[9, 9, 9, 9]));

        let mut out = [0u8; 4];
        assert!(ch.try_read(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(ch.try_read(&mut out));
        assert_eq!(out, [5, 6, 7, 8]);
        assert!(!ch.try_read(&mut out));
    }

    #[test]
    fn wraps_around_capacity() {
        let ch = Arc::new(Channel::new("t", 1, 3));
        register_loopback(&ch);
        for round in 0..5u8 {
            for i in 0..3u8 {
                assert!(ch.try_write(&[round * 10 + i]));
                let mut out = [0u8; 1];
                assert!(ch.try_read(&mut out));
                assert_eq!(out, [round * 10 + i]);
            }
        }
    }

    #[test]
    fn capacity_bound_never_exceeded() {
        let ch = Arc::new(Channel::new("t", 2, 4));
        register_loopback(&ch);
        let mut written = 0;
        while ch.try_write(&[1, 2]) {
            written += 1;
            assert!(written <= 4);
        }
        assert_eq!(written, 4);
    }

    #[test]
    fn write_from_unregistered_writer_is_fatal() {
        let ch = Channel::new("t", 4, 2);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            ch.try_write(&[1, 2, 3, 4]);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn read_from_wrong_thread_is_fatal() {
        let ch = Arc::new(Channel::new("t", 4, 2));
        let ctx = Context::new("reader");
        let thread = Thread::new("reader");
        // Note: no `bind_current_for_test()` call, so `thread` is bound
        // to the context but is not the test harness's "current" thread.
        ctx.bind_thread(Arc::clone(&thread));
        ctx.add_channel(0, Arc::clone(&ch), ChannelFlags::READ);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut out = [0u8; 4];
            ch.try_read(&mut out);
        }));
        assert!(result.is_err());
    }
}
