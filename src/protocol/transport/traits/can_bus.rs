//! Minimal abstraction for an asynchronous CAN bus. Allows the library to plug
//! into various implementations (embedded HAL, SocketCAN, virtual bus, a
//! queued decorator, etc.).
use crate::protocol::transport::can_frame::CanFrame;
use futures_util::Future;

/// Notification delivered by the bus receive path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusEvent {
    /// A frame seen on the bus, addressed to us or not.
    Received(CanFrame),
    /// One of our own frames left the controller (TX echo).
    Transmitted(CanFrame),
    /// The controller gave up on one of our frames after accepting it.
    TransmitFailed(CanFrame),
}

/// Contract to submit frames and listen to the bus asynchronously.
pub trait CanBus {
    type Error: core::fmt::Debug;

    /// `true` when the driver reports `BusEvent::Transmitted`/`TransmitFailed`
    /// for every accepted frame. When `false`, an accepted submit counts as
    /// transmitted.
    const CONFIRMS_TRANSMIT: bool = false;

    /// Submit a frame, best effort. Returns the number of frames accepted;
    /// `0` means the driver refused it. No retry is performed by the caller.
    fn transmit<'a>(
        &'a mut self,
        frame: &'a CanFrame,
    ) -> impl Future<Output = Result<usize, Self::Error>> + 'a;

    /// Retrieve the next bus notification. An error is a background fault of
    /// the driver's own send/receive loop.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a notification.
    fn recv<'a>(&'a mut self) -> impl Future<Output = Result<BusEvent, Self::Error>> + 'a;
}
