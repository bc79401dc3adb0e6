//! Transport layer: CAN frame representation, 11/29-bit identifier handling,
//! bus and timer abstraction traits, and the ISO-TP segmentation engine.
//!
//! ## Layering
//!
//! - [`can_frame`] / [`can_id`]: raw frames and identifiers as seen on the bus.
//! - [`traits`]: the two seams a target provides (`CanBus`, `KorriTimer`).
//! - [`isotp`]: everything above a single frame.

pub mod can_frame;
pub mod can_id;
pub mod isotp;
pub mod traits;
