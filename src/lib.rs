//! `korri-isotp` library: ISO 15765-2 (ISO-TP) transport over classic CAN and
//! CAN FD in a `no_std` environment. The crate exposes the CAN primitives
//! (frame, identifier, bus and timer traits) and the ISO-TP engine built on
//! top of them: PCI codec, conversation state machines, router, scheduler and
//! the application-facing conversation handle.
#![no_std]
//==================================================================================
extern crate alloc;
//==================================================================================
/// Domain and low-level errors (CAN identifier construction, PCI encoding and
/// decoding, configuration, transfer outcomes, scheduler faults).
pub mod error;
/// CAN transport and the ISO-TP protocol engine.
pub mod protocol;
//==================================================================================
