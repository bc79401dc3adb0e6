//! Arbitration of one shared bus among the registered conversations.
//!
//! A single [`SchedulerRunner`] per bus connection is the only caller of
//! [`CanBus::transmit`]. Each pass:
//!
//! 1. polls every conversation (deadlines, CF segmentation);
//! 2. drains every pending flow control, before any data frame;
//! 3. sends at most one data frame, from the ready conversation served least
//!    recently, unless the bus guard since the last data frame is still running;
//! 4. reports the submit outcome back to the owning conversation.
//!
//! Between passes the runner sleeps until the next bus event, an application
//! wake-up, or one tick, whichever comes first. The tick bounds how late a
//! deadline can be detected.
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant};
use futures_util::future::{select, Either};
use futures_util::pin_mut;

use crate::error::{IsoTpError, SchedulerError};
use crate::protocol::transport::isotp::conversation::{ConversationCell, Outgoing};
use crate::protocol::transport::isotp::router::Router;
use crate::protocol::transport::isotp::DEFAULT_TICK_US;
use crate::protocol::transport::traits::{
    can_bus::{BusEvent, CanBus},
    korri_timer::KorriTimer,
};

//==================================================================================SCHEDULER
/// Conversation registry shared between the application and the runner.
///
/// `new` is `const`, so a scheduler can live in a `static`.
pub struct Scheduler<'a> {
    router: Mutex<CriticalSectionRawMutex, RefCell<Router<'a>>>,
    wake: Signal<CriticalSectionRawMutex, ()>,
    tick: Duration,
}

impl Default for Scheduler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Scheduler<'a> {
    pub const fn new() -> Self {
        Self::with_tick(Duration::from_micros(DEFAULT_TICK_US))
    }

    /// Scheduler waking at least every `tick` to fire deadlines.
    pub const fn with_tick(tick: Duration) -> Self {
        Self {
            router: Mutex::new(RefCell::new(Router::new())),
            wake: Signal::new(),
            tick,
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    /// Add a conversation to the bus.
    pub fn register(&self, cell: &'a ConversationCell) -> Result<(), IsoTpError> {
        self.with_router(|router| router.register(cell))?;
        self.wake();
        Ok(())
    }

    /// Remove a conversation; transfers in progress end with `Cancelled`.
    pub fn unregister(&self, cell: &ConversationCell) {
        if self.with_router(|router| router.unregister(cell)) {
            cell.update(|core| core.cancel());
        }
        self.wake();
    }

    pub fn is_registered(&self, cell: &ConversationCell) -> bool {
        self.with_router(|router| router.contains(cell))
    }

    /// Ask the runner for an immediate pass.
    pub fn wake(&self) {
        self.wake.signal(());
    }

    /// Bind the scheduler to a bus and a clock.
    pub fn runner<'s, C: CanBus, T: KorriTimer>(
        &'s self,
        bus: C,
        timer: T,
    ) -> SchedulerRunner<'s, 'a, C, T> {
        SchedulerRunner {
            scheduler: self,
            bus,
            timer,
            last_data_at: None,
            passes: 0,
        }
    }

    fn with_router<R>(&self, f: impl FnOnce(&mut Router<'a>) -> R) -> R {
        self.router.lock(|router| f(&mut router.borrow_mut()))
    }

    fn conversations(&self) -> Vec<&'a ConversationCell> {
        self.with_router(|router| router.conversations())
    }
}

//==================================================================================RUNNER
/// The loop driving one bus on behalf of a [`Scheduler`].
pub struct SchedulerRunner<'s, 'a, C: CanBus, T: KorriTimer> {
    scheduler: &'s Scheduler<'a>,
    bus: C,
    timer: T,
    /// Submit instant of the last data frame, for the bus guard.
    last_data_at: Option<Instant>,
    passes: u64,
}

impl<'s, 'a, C: CanBus, T: KorriTimer> SchedulerRunner<'s, 'a, C, T> {
    pub fn bus(&self) -> &C {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut C {
        &mut self.bus
    }

    /// Drive the bus until its receive path reports a fault.
    ///
    /// On a fault every registered conversation fails with `BusFault`, the
    /// registry is cleared and the bus error is returned. `CanBus::recv` must
    /// be cancel-safe: it is raced against the tick and the wake signal.
    pub async fn run(&mut self) -> Result<(), SchedulerError<C::Error>> {
        loop {
            let now = self.timer.now();
            let progressed = self.pass(now).await;
            let deadline = if progressed {
                now
            } else {
                now + self.scheduler.tick
            };

            let event = {
                let recv = self.bus.recv();
                let wake = self.scheduler.wake.wait();
                let sleep = self.timer.delay_until(deadline);
                pin_mut!(recv, wake, sleep);
                match select(recv, select(wake, sleep)).await {
                    Either::Left((event, _)) => Some(event),
                    Either::Right(_) => None,
                }
            };

            match event {
                Some(Ok(event)) => {
                    let now = self.timer.now();
                    self.dispatch(event, now);
                }
                Some(Err(err)) => {
                    #[cfg(feature = "defmt")]
                    defmt::error!("Bus receive fault, tearing down all conversations");

                    self.teardown();
                    return Err(SchedulerError::Bus(err));
                }
                None => {}
            }
        }
    }

    /// One arbitration pass at `now`. Returns whether any frame was submitted.
    pub async fn pass(&mut self, now: Instant) -> bool {
        let conversations = self.scheduler.conversations();
        if conversations.is_empty() {
            return false;
        }
        self.passes = self.passes.wrapping_add(1);

        for cell in &conversations {
            cell.update(|core| core.poll(now));
        }

        let mut progressed = false;
        for &cell in &conversations {
            while let Some(out) = cell.update(|core| core.pop_flow_control(now)) {
                self.submit(cell, out, now).await;
                progressed = true;
            }
        }

        if self.guard_running(&conversations, now) {
            return progressed;
        }
        let picked = self.scheduler.with_router(|router| {
            router.least_recently_served(|cell| cell.update(|core| core.has_ready_data()))
        });
        if let Some(cell) = picked {
            if let Some(out) = cell.update(|core| core.pop_data(now)) {
                let stamp = self.passes;
                self.submit(cell, out, now).await;
                self.scheduler
                    .with_router(|router| router.mark_served(cell, stamp));
                self.last_data_at = Some(now);
                progressed = true;
            }
        }
        progressed
    }

    /// Hand a bus notification to the conversation it belongs to.
    pub fn dispatch(&mut self, event: BusEvent, now: Instant) {
        match event {
            BusEvent::Received(frame) => {
                match self.scheduler.with_router(|router| router.route(&frame)) {
                    Some(cell) => cell.update(|core| core.on_frame(&frame, now)),
                    None => {
                        #[cfg(feature = "defmt")]
                        defmt::trace!("No conversation for frame {:#X}", frame.id.raw());
                    }
                }
            }
            BusEvent::Transmitted(frame) => {
                if let Some(cell) = self
                    .scheduler
                    .with_router(|router| router.route_transmitted(&frame))
                {
                    cell.update(|core| core.on_echo(&frame, true, now));
                }
            }
            BusEvent::TransmitFailed(frame) => {
                if let Some(cell) = self
                    .scheduler
                    .with_router(|router| router.route_transmitted(&frame))
                {
                    cell.update(|core| core.on_echo(&frame, false, now));
                }
            }
        }
    }

    /// The widest bus guard among the registered conversations is still
    /// running since the last data frame.
    fn guard_running(&self, conversations: &[&'a ConversationCell], now: Instant) -> bool {
        let guard = conversations
            .iter()
            .filter_map(|cell| cell.options().bus_guard)
            .max();
        match (guard, self.last_data_at) {
            (Some(gap), Some(last)) => now < last + gap,
            _ => false,
        }
    }

    async fn submit(&mut self, cell: &'a ConversationCell, out: Outgoing, now: Instant) {
        match self.bus.transmit(&out.frame).await {
            Ok(0) => cell.update(|core| core.on_transmit_failed(out.token, IsoTpError::BusRejected)),
            Ok(_) => {
                if !C::CONFIRMS_TRANSMIT {
                    cell.update(|core| core.on_transmitted(out.token, now));
                }
            }
            Err(_err) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("Transmit error on frame {:#X}", out.frame.id.raw());

                cell.update(|core| core.on_transmit_failed(out.token, IsoTpError::BusRejected));
            }
        }
    }

    fn teardown(&mut self) {
        let conversations = self.scheduler.with_router(|router| router.clear());
        for cell in conversations {
            cell.update(|core| core.fail_all(IsoTpError::BusFault));
        }
    }
}
