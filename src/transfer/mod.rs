//! Chunked Transfer Protocol
//!
//! Moves file payloads between peers as a sequence of checksummed chunks.
//!
//! ## Submodules
//! - **`codec`**: SHA-256 digests and the fixed-header chunk frame.
//! - **`planner`**: Size-tiered splitting of a file into chunk spans.
//! - **`progress`**: Bytes-written accounting, rate and ETA.
//! - **`session`**: The destination-side fetch loop (sequential or parallel,
//!   with per-chunk retry).

pub mod codec;
pub mod planner;
pub mod progress;
pub mod session;
