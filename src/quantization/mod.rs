//! 1-bit scalar quantization: codec and persisted state.
//!
//! The state (per-dimension thresholds plus an optional rotation matrix)
//! is immutable once loaded and lives in a versioned sidecar indexed by
//! field number. The codec is a pure function from a float vector to a
//! fixed-width bit-packed code. Training is out of scope; thresholds are
//! only ever read, carried forward, or written back verbatim.

pub mod onebit;
pub mod state;

pub use onebit::encode;
pub use state::OneBitState;
