//! High-level components: CAN frame transport and the ISO-TP engine.
pub mod transport;
