//! Application handle on one registered conversation: send, receive,
//! request/response and cancellation.
//!
//! ```rust,ignore
//! static SCHEDULER: Scheduler<'static> = Scheduler::new();
//! static CELL: StaticCell<ConversationCell> = StaticCell::new();
//!
//! let endpoint = Endpoint::normal(tester_id, ecu_id);
//! let cell = CELL.init(ConversationCell::new(endpoint, Options::default())?);
//! let conversation = Conversation::new(&SCHEDULER, cell)?;
//!
//! spawner.spawn(bus_task(SCHEDULER.runner(bus, timer)))?;
//! let reply = conversation
//!     .request(&[0x22, 0xF1, 0x90], Duration::from_millis(500), &mut timer)
//!     .await?;
//! ```
use embassy_time::Duration;
use futures_util::future::{select, Either};
use futures_util::pin_mut;

use crate::error::IsoTpError;
use crate::protocol::transport::isotp::conversation::{ConversationCell, Datagram};
use crate::protocol::transport::isotp::endpoint::Endpoint;
use crate::protocol::transport::isotp::scheduler::Scheduler;
use crate::protocol::transport::traits::korri_timer::KorriTimer;

/// Registered conversation. Dropping it unregisters from the scheduler.
pub struct Conversation<'a> {
    scheduler: &'a Scheduler<'a>,
    cell: &'a ConversationCell,
}

impl<'a> Conversation<'a> {
    /// Register `cell` with `scheduler`.
    pub fn new(scheduler: &'a Scheduler<'a>, cell: &'a ConversationCell) -> Result<Self, IsoTpError> {
        scheduler.register(cell)?;
        Ok(Self { scheduler, cell })
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.cell.endpoint()
    }

    /// Send `payload` and wait until its last frame is confirmed on the bus.
    ///
    /// A failed send leaves the conversation ready for the next one. Fails
    /// with `NotRegistered` once a bus fault has torn the conversation down.
    pub async fn send(&self, payload: &[u8]) -> Result<(), IsoTpError> {
        if !self.scheduler.is_registered(self.cell) {
            return Err(IsoTpError::NotRegistered);
        }
        // A rejected send must not clear the signal of the one in progress.
        self.cell.update(|core| {
            core.begin_send(payload)?;
            self.cell.completion.reset();
            Ok::<(), IsoTpError>(())
        })?;
        self.scheduler.wake();

        let result = self.cell.completion.wait().await;
        if result.is_err() {
            self.cell.update(|core| core.reset());
        }
        result
    }

    /// Next inbound datagram, or the failure of the reception in progress.
    pub async fn recv(&self) -> Result<Datagram, IsoTpError> {
        self.cell.datagrams.receive().await
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&self) -> Option<Result<Datagram, IsoTpError>> {
        self.cell.datagrams.try_receive().ok()
    }

    /// Send `payload` and wait for the peer's reply datagram.
    ///
    /// The reply slot is armed before the first frame leaves, so a fast
    /// response cannot be missed. `timeout` runs from the end of the send;
    /// on expiry the slot is disarmed and `ResponseTimeout` returned.
    pub async fn request<T: KorriTimer>(
        &self,
        payload: &[u8],
        timeout: Duration,
        timer: &mut T,
    ) -> Result<Datagram, IsoTpError> {
        self.cell.reply.reset();
        self.cell.update(|core| core.arm_reply());

        if let Err(err) = self.send(payload).await {
            self.cell.update(|core| core.disarm_reply());
            return Err(err);
        }

        let deadline = timer.now() + timeout;
        let reply = self.cell.reply.wait();
        let expiry = timer.delay_until(deadline);
        pin_mut!(reply, expiry);
        match select(reply, expiry).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => {
                self.cell.update(|core| core.disarm_reply());
                // A reply racing the timeout wins.
                self.cell
                    .reply
                    .try_take()
                    .unwrap_or(Err(IsoTpError::ResponseTimeout))
            }
        }
    }

    /// Abort the transfers in progress; waiting calls end with `Cancelled`.
    pub fn cancel(&self) {
        self.cell.update(|core| core.cancel());
        self.scheduler.wake();
    }
}

impl Drop for Conversation<'_> {
    fn drop(&mut self) {
        self.scheduler.unregister(self.cell);
    }
}
