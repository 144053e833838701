//! Runtime for a cooperatively scheduled packet-processing dataflow engine.
//!
//! Applications build a graph of stages (`thread`) that exchange data over
//! bounded SPSC `channel`s, read/write an associative store through a
//! `map` arbiter, and manipulate packet bytes through the fixed-function
//! taps in `packet`. The `system` module is the lifecycle owner that wires
//! everything together and starts the graph.

pub mod channel;
pub mod config;
pub mod context;
pub mod idle;
pub mod kernel;
pub mod map;
pub mod packet;
pub mod system;
pub mod thread;

mod error;

pub use error::{Error, MapRejection, Result};

/// An OS error code, reported via `strerror` the way the teacher's own
/// `Errno` does it. Unlike the teacher (which reads the global `errno`
/// immediately after a raw libc call via `LastErrno`), every OS call this
/// crate makes goes through a `std` wrapper that already captures the
/// code into an `io::Error`, so the only constructor needed is
/// `from_raw_os_error` -- there is no raw-syscall call site left to read
/// a live global `errno` from.
pub struct Errno(libc::c_int);

impl Errno {
    /// Wraps an OS error code already captured by `std` (e.g.
    /// `io::Error::raw_os_error()` after a failed OS call), for the
    /// "fatal with the underlying errno reported" path (§7).
    pub(crate) fn from_raw_os_error(code: libc::c_int) -> Self {
        Errno(code)
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = unsafe { libc::strerror(self.0) };
        let cstr = unsafe { std::ffi::CStr::from_ptr(st) };
        write!(f, "{}", cstr.to_string_lossy())
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({}: {})", self.0, self)
    }
}

/// Emits a diagnostic and aborts the process.
///
/// This is the Rust analogue of the C original's "emit a diagnostic under
/// the stderr mutex and exit" path for programmer-contract violations
/// (wrong thread on a channel, duplicate registration, ...). Such
/// violations are bugs in the caller's graph, not reportable runtime
/// conditions, so there is no `Result` to return here.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}

pub(crate) use fatal;
