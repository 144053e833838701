//! Compile-time constants for the pieces of the graph that the original
//! hard-codes rather than making configurable. The graph is built once and
//! run (no dynamic reconfiguration), so these are `const`s, not a loaded
//! configuration file.

/// Depth (in elements) of each map-tap client's request channel (§4.6).
pub const MAP_CLIENT_REQUEST_DEPTH: usize = 8;

/// Depth (in elements) of each map-tap client's response channel (§4.6).
pub const MAP_CLIENT_RESPONSE_DEPTH: usize = 16;

/// Data bytes carried by one `simple_bus` word (`simple_bus.hpp`:
/// `log_data_bytes = 6` -> `data_bytes = 64`).
pub const SIMPLE_BUS_DATA_BYTES: usize = 64;

/// Width, in bits, of the length fields used by the packet-length tap
/// (§4.7: "All numerics are 16-bit unsigned").
pub type LengthField = u16;
