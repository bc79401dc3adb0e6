//! ISO 15765-2 (ISO-TP) transport engine: PCI codec, per-conversation send
//! and receive state machines, a router and a scheduler sharing one bus
//! between many conversations.
//!
//! ## Timing parameters
//!
//! | Parameter | Side     | Bounds                                            |
//! |-----------|----------|---------------------------------------------------|
//! | N_As      | sender   | submit → bus confirmation of any data frame       |
//! | N_Ar      | receiver | submit → bus confirmation of a flow control       |
//! | N_Bs      | sender   | FF / last CF of a block → next flow control       |
//! | N_Br      | receiver | spacing of WT flow controls before CTS            |
//! | N_Cs      | sender   | CF confirmation (+ STmin) → next CF submission    |
//! | N_Cr      | receiver | flow control / CF → next CF                       |

pub mod codec;
pub mod conversation;
pub mod endpoint;
pub mod facade;
pub mod options;
pub mod pool;
pub mod router;
pub mod scheduler;
pub mod timing;

/// Default for N_As, N_Ar, N_Bs, N_Cs and N_Cr (ms), as recommended by ISO 15765-2.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default N_Br (ms): delay between two WT flow controls.
///
/// Must stay well below the peer's N_Bs (0.9 × N_Bs at most) so that WT frames
/// keep the sender alive.
pub const DEFAULT_N_BR_MS: u64 = 100;

/// Largest datagram announced by a 12-bit first frame.
pub const MAX_CLASSIC_DATAGRAM: usize = 4095;

/// Largest datagram announced by an escalated (32-bit) first frame.
pub const MAX_FD_DATAGRAM: usize = u32::MAX as usize;

/// Default number of consecutive WT flow controls tolerated by a sender.
pub const DEFAULT_MAX_WAIT_FRAMES: u8 = 10;

/// Default scheduler tick (µs): upper bound on timeout detection latency.
pub const DEFAULT_TICK_US: u64 = 1000;

/// Default number of frame buffers owned by one conversation.
pub const DEFAULT_POOL_CAPACITY: usize = 8;

/// Depth of the per-conversation datagram queue.
pub const DATAGRAM_QUEUE_DEPTH: usize = 4;
