//! One ISO-TP conversation: independent send and receive state machines over
//! a shared frame pool, the outbound flow-control and data queues, and the
//! in-flight table used to match bus confirmations.
//!
//! [`ConversationCore`] is sans-IO: every entry point takes the current
//! [`Instant`] and results are collected as [`ConversationEvent`]s.
//! [`ConversationCell`] wraps it in a critical section and publishes those
//! events to the application-facing signals and channel.
use alloc::collections::{BinaryHeap, VecDeque};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::cmp::Ordering;

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use embassy_sync::channel::{Channel, TrySendError};
use embassy_sync::signal::Signal;
use embassy_time::Instant;

use crate::error::{CodecError, ConfigError, IsoTpError, TimeoutKind};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::isotp::codec::{self, FlowStatus, Pci};
use crate::protocol::transport::isotp::endpoint::Endpoint;
use crate::protocol::transport::isotp::options::Options;
use crate::protocol::transport::isotp::pool::{FramePool, PooledFrame};
use crate::protocol::transport::isotp::timing::SlidingWindowDeadline;
use crate::protocol::transport::isotp::DATAGRAM_QUEUE_DEPTH;

mod receiver;
mod sender;

pub use receiver::RxState;
pub use sender::TxState;

use receiver::RxMachine;
use sender::TxMachine;

//==================================================================================EVENTS
/// A reassembled message. The buffer is handed over to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome produced by the state machines, drained with [`ConversationCore::take_events`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// The pending send finished, successfully or not.
    SendComplete(Result<(), IsoTpError>),
    /// An inbound datagram, or the failure of one in progress.
    Received(Result<Datagram, IsoTpError>),
    /// Inbound datagram consumed by an armed request.
    Reply(Result<Datagram, IsoTpError>),
}

/// A frame taken from a pending queue, to be submitted to the bus.
///
/// `token` identifies it in the in-flight table until it is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing {
    pub token: u32,
    pub frame: CanFrame,
}

//==================================================================================QUEUES
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataKind {
    Single,
    First { len: usize },
    Consecutive { len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameRole {
    Data { kind: DataKind, generation: u32 },
    FlowControl { status: FlowStatus, generation: u32 },
}

#[derive(Debug)]
struct PendingData {
    frame: PooledFrame,
    kind: DataKind,
    generation: u32,
}

/// Queued flow control. OVFLW outranks CTS/WT; equal ranks leave in FIFO order.
#[derive(Debug)]
struct PendingFlowControl {
    frame: PooledFrame,
    status: FlowStatus,
    order: u64,
    generation: u32,
}

impl PendingFlowControl {
    fn rank(&self) -> u8 {
        match self.status {
            FlowStatus::Overflow => 1,
            FlowStatus::ContinueToSend | FlowStatus::Wait => 0,
        }
    }
}

impl PartialEq for PendingFlowControl {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingFlowControl {}

impl PartialOrd for PendingFlowControl {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingFlowControl {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher rank first, then the lower order number.
        self.rank()
            .cmp(&other.rank())
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Debug)]
struct InFlight {
    token: u32,
    frame: PooledFrame,
    role: FrameRole,
}

//==================================================================================CORE
/// Send and receive state of one endpoint pair.
#[derive(Debug)]
pub struct ConversationCore {
    endpoint: Endpoint,
    options: Options,
    tx: TxMachine,
    rx: RxMachine,
    pool: FramePool,
    pending_fc: BinaryHeap<PendingFlowControl>,
    pending_data: VecDeque<PendingData>,
    in_flight: Vec<InFlight>,
    /// N_As over submitted data frames.
    n_as: SlidingWindowDeadline,
    /// N_Ar over submitted flow controls.
    n_ar: SlidingWindowDeadline,
    next_token: u32,
    fc_order: u64,
    reply_armed: bool,
    events: Vec<ConversationEvent>,
}

impl ConversationCore {
    /// Validate `endpoint` and `options` and build an idle conversation.
    pub fn new(endpoint: Endpoint, options: Options) -> Result<Self, ConfigError> {
        endpoint.validate()?;
        options.validate()?;
        Ok(Self {
            endpoint,
            options,
            tx: TxMachine::new(),
            rx: RxMachine::new(),
            pool: FramePool::new(options.pool_capacity, endpoint.tx_id),
            pending_fc: BinaryHeap::new(),
            pending_data: VecDeque::new(),
            in_flight: Vec::new(),
            n_as: SlidingWindowDeadline::new(options.timing.n_as),
            n_ar: SlidingWindowDeadline::new(options.timing.n_ar),
            next_token: 0,
            fc_order: 0,
            reply_armed: false,
            events: Vec::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn tx_state(&self) -> TxState {
        self.tx.state
    }

    pub fn rx_state(&self) -> RxState {
        self.rx.state
    }

    /// Frame buffers currently owned by a queue or the in-flight table.
    pub fn frames_in_use(&self) -> usize {
        self.pool.in_use()
    }

    //------------------------------------------------------------------------------inbound
    /// Feed a frame received on the bus. Frames for other endpoints are ignored.
    pub fn on_frame(&mut self, frame: &CanFrame, now: Instant) {
        let decoded = match codec::decode(&self.endpoint, self.options.mode, frame) {
            Ok(decoded) => decoded,
            Err(CodecError::IdMismatch | CodecError::AddressMismatch { .. }) => return,
            Err(err) => {
                self.on_malformed(err);
                return;
            }
        };

        match decoded.pci {
            Pci::Single { .. } => self.on_single(decoded.payload),
            Pci::First { len } => self.on_first(len, decoded.payload, now),
            Pci::Consecutive { sequence } => self.on_consecutive(sequence, decoded.payload, now),
            Pci::FlowControl {
                status,
                block_size,
                st_min,
            } => self.on_flow_control(status, block_size, st_min, now),
        }
    }

    /// A malformed flow control ends the send waiting for it; any other
    /// malformed frame ends the reception in progress.
    fn on_malformed(&mut self, err: CodecError) {
        #[cfg(feature = "defmt")]
        defmt::debug!("Dropping malformed frame: {}", err);

        match err {
            CodecError::InvalidFlowStatus { .. } if self.tx.is_waiting_flow_control() => {
                self.fail_tx(IsoTpError::Malformed(err));
            }
            _ if self.rx.state == RxState::RecvCf => self.fail_rx(IsoTpError::Malformed(err)),
            _ => {}
        }
    }

    //------------------------------------------------------------------------------timers
    /// Fire expired deadlines and segment the next consecutive frame when due.
    pub fn poll(&mut self, now: Instant) {
        if let Some(token) = self.n_as.expired(now) {
            self.n_as.remove(token);
            if self.tx.is_active() {
                self.fail_tx(IsoTpError::Timeout(TimeoutKind::As));
            }
        }
        if let Some(token) = self.n_ar.expired(now) {
            self.n_ar.remove(token);
            if self.rx.state == RxState::RecvCf {
                self.fail_rx(IsoTpError::Timeout(TimeoutKind::Ar));
            }
        }
        self.poll_tx(now);
        self.poll_rx(now);
    }

    //------------------------------------------------------------------------------outbound
    /// Whether a data frame is queued for submission.
    pub fn has_ready_data(&self) -> bool {
        !self.pending_data.is_empty()
    }

    /// Whether a flow control is queued for submission.
    pub fn has_pending_flow_control(&self) -> bool {
        !self.pending_fc.is_empty()
    }

    /// Take the highest-priority pending flow control and start its N_Ar budget.
    pub fn pop_flow_control(&mut self, now: Instant) -> Option<Outgoing> {
        let pending = self.pending_fc.pop()?;
        let token = self.allocate_token();
        let frame = *self.pool.frame(&pending.frame);
        self.n_ar.insert(token, now);
        self.in_flight.push(InFlight {
            token,
            frame: pending.frame,
            role: FrameRole::FlowControl {
                status: pending.status,
                generation: pending.generation,
            },
        });
        Some(Outgoing { token, frame })
    }

    /// Take the oldest pending data frame and start its N_As budget.
    pub fn pop_data(&mut self, now: Instant) -> Option<Outgoing> {
        let pending = self.pending_data.pop_front()?;
        let token = self.allocate_token();
        let frame = *self.pool.frame(&pending.frame);
        if matches!(pending.kind, DataKind::Consecutive { .. }) {
            self.tx.n_cs.disarm();
        }
        self.n_as.insert(token, now);
        self.in_flight.push(InFlight {
            token,
            frame: pending.frame,
            role: FrameRole::Data {
                kind: pending.kind,
                generation: pending.generation,
            },
        });
        Some(Outgoing { token, frame })
    }

    //------------------------------------------------------------------------------confirmations
    /// The frame submitted under `token` made it onto the bus.
    pub fn on_transmitted(&mut self, token: u32, now: Instant) {
        let Some(entry) = self.take_in_flight(token) else {
            return;
        };
        self.pool.release(entry.frame);
        match entry.role {
            FrameRole::Data { kind, generation } => self.confirm_data(kind, generation, now),
            FrameRole::FlowControl { status, generation } => {
                self.confirm_flow_control(status, generation, now)
            }
        }
    }

    /// The frame submitted under `token` was refused or dropped by the bus.
    pub fn on_transmit_failed(&mut self, token: u32, err: IsoTpError) {
        let Some(entry) = self.take_in_flight(token) else {
            return;
        };
        self.pool.release(entry.frame);

        #[cfg(feature = "defmt")]
        defmt::warn!("Frame {} not transmitted: {}", token, err);

        match entry.role {
            FrameRole::Data { generation, .. }
                if generation == self.tx.generation && self.tx.is_active() =>
            {
                self.fail_tx(err)
            }
            FrameRole::FlowControl { generation, .. }
                if generation == self.rx.generation && self.rx.state == RxState::RecvCf =>
            {
                self.fail_rx(err)
            }
            _ => {}
        }
    }

    /// Whether an identical frame is in flight, waiting for its echo.
    pub fn awaits_echo(&self, frame: &CanFrame) -> bool {
        self.in_flight
            .iter()
            .any(|entry| self.pool.frame(&entry.frame) == frame)
    }

    /// Match a transmit echo (`ok`) or a late transmit failure against the
    /// oldest identical in-flight frame.
    pub fn on_echo(&mut self, frame: &CanFrame, ok: bool, now: Instant) {
        let token = self
            .in_flight
            .iter()
            .find(|entry| self.pool.frame(&entry.frame) == frame)
            .map(|entry| entry.token);
        match (token, ok) {
            (Some(token), true) => self.on_transmitted(token, now),
            (Some(token), false) => self.on_transmit_failed(token, IsoTpError::BusRejected),
            (None, _) => {}
        }
    }

    //------------------------------------------------------------------------------application
    /// Route the next inbound datagram to the reply slot instead of the queue.
    pub fn arm_reply(&mut self) {
        self.reply_armed = true;
    }

    pub fn disarm_reply(&mut self) {
        self.reply_armed = false;
    }

    /// Abort the transfers in progress. Queued frames are released; frames
    /// already handed to the bus cannot be recalled.
    pub fn cancel(&mut self) {
        if self.tx.is_active() {
            self.fail_tx(IsoTpError::Cancelled);
        }
        self.tx.clear_failure();
        if self.rx.state == RxState::RecvCf {
            self.fail_rx(IsoTpError::Cancelled);
        }
        if self.reply_armed {
            self.reply_armed = false;
            self.events.push(ConversationEvent::Reply(Err(IsoTpError::Cancelled)));
        }
    }

    /// Tear down both directions with `err` and release every frame.
    pub fn fail_all(&mut self, err: IsoTpError) {
        if self.tx.is_active() {
            self.fail_tx(err);
        }
        if self.rx.state == RxState::RecvCf {
            self.fail_rx(err);
        }
        if self.reply_armed {
            self.reply_armed = false;
            self.events.push(ConversationEvent::Reply(Err(err)));
        }
        while let Some(pending) = self.pending_fc.pop() {
            self.pool.release(pending.frame);
        }
        for entry in core::mem::take(&mut self.in_flight) {
            self.pool.release(entry.frame);
        }
        self.n_as.clear();
        self.n_ar.clear();
    }

    /// Events produced since the last call.
    pub fn take_events(&mut self) -> Vec<ConversationEvent> {
        core::mem::take(&mut self.events)
    }

    //------------------------------------------------------------------------------helpers
    fn allocate_token(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        token
    }

    fn take_in_flight(&mut self, token: u32) -> Option<InFlight> {
        let index = self.in_flight.iter().position(|entry| entry.token == token)?;
        self.n_as.remove(token);
        self.n_ar.remove(token);
        Some(self.in_flight.swap_remove(index))
    }

    /// Encode a data frame into a pooled buffer and queue it.
    fn enqueue_data(
        &mut self,
        kind: DataKind,
        encode: impl FnOnce(&Endpoint, &Options, &mut CanFrame) -> Result<(), CodecError>,
    ) -> Result<(), IsoTpError> {
        let handle = self.pool.acquire()?;
        if let Err(err) = encode(&self.endpoint, &self.options, self.pool.frame_mut(&handle)) {
            self.pool.release(handle);
            return Err(err.into());
        }
        self.pending_data.push_back(PendingData {
            frame: handle,
            kind,
            generation: self.tx.generation,
        });
        Ok(())
    }

    /// Encode a flow control carrying our receive policy and queue it.
    fn enqueue_flow_control(&mut self, status: FlowStatus) -> Result<(), IsoTpError> {
        let policy = self.options.rx;
        // Validated by `Options::validate`.
        let st_min = codec::encode_st_min(policy.st_min).unwrap_or(0x7F);
        let handle = self.pool.acquire()?;
        if let Err(err) = codec::encode_flow_control(
            &self.endpoint,
            self.options.mode,
            self.options.padding,
            status,
            policy.block_size,
            st_min,
            self.pool.frame_mut(&handle),
        ) {
            self.pool.release(handle);
            return Err(err.into());
        }
        let order = self.fc_order;
        self.fc_order = self.fc_order.wrapping_add(1);
        self.pending_fc.push(PendingFlowControl {
            frame: handle,
            status,
            order,
            generation: self.rx.generation,
        });
        Ok(())
    }

    /// Release queued and in-flight data frames.
    fn drop_data_frames(&mut self) {
        while let Some(pending) = self.pending_data.pop_front() {
            self.pool.release(pending.frame);
        }
        self.release_in_flight(|role| matches!(role, FrameRole::Data { .. }));
    }

    /// Release queued and in-flight flow controls.
    fn drop_flow_controls(&mut self) {
        while let Some(pending) = self.pending_fc.pop() {
            self.pool.release(pending.frame);
        }
        self.release_in_flight(|role| matches!(role, FrameRole::FlowControl { .. }));
    }

    fn release_in_flight(&mut self, select: impl Fn(&FrameRole) -> bool) {
        let mut index = 0;
        while index < self.in_flight.len() {
            if select(&self.in_flight[index].role) {
                let entry = self.in_flight.swap_remove(index);
                self.n_as.remove(entry.token);
                self.n_ar.remove(entry.token);
                self.pool.release(entry.frame);
            } else {
                index += 1;
            }
        }
    }

    /// Publish an inbound result, to the reply slot when a request is waiting.
    fn deliver(&mut self, result: Result<Datagram, IsoTpError>) {
        let for_reply = self.reply_armed && result != Err(IsoTpError::Interrupted);
        if for_reply {
            self.reply_armed = false;
            self.events.push(ConversationEvent::Reply(result));
        } else {
            self.events.push(ConversationEvent::Received(result));
        }
    }
}

//==================================================================================CELL
/// A [`ConversationCore`] behind a critical section, plus the primitives the
/// application waits on.
pub struct ConversationCell {
    endpoint: Endpoint,
    options: Options,
    core: Mutex<CriticalSectionRawMutex, RefCell<ConversationCore>>,
    pub(crate) completion: Signal<CriticalSectionRawMutex, Result<(), IsoTpError>>,
    pub(crate) reply: Signal<CriticalSectionRawMutex, Result<Datagram, IsoTpError>>,
    pub(crate) datagrams:
        Channel<CriticalSectionRawMutex, Result<Datagram, IsoTpError>, DATAGRAM_QUEUE_DEPTH>,
}

impl ConversationCell {
    pub fn new(endpoint: Endpoint, options: Options) -> Result<Self, ConfigError> {
        let core = ConversationCore::new(endpoint, options)?;
        Ok(Self {
            endpoint,
            options,
            core: Mutex::new(RefCell::new(core)),
            completion: Signal::new(),
            reply: Signal::new(),
            datagrams: Channel::new(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn awaits_echo(&self, frame: &CanFrame) -> bool {
        self.core.lock(|core| core.borrow().awaits_echo(frame))
    }

    /// Run `f` on the core inside the critical section, then publish the
    /// events it produced.
    pub fn update<R>(&self, f: impl FnOnce(&mut ConversationCore) -> R) -> R {
        let (result, events) = self.core.lock(|core| {
            let mut core = core.borrow_mut();
            let result = f(&mut core);
            (result, core.take_events())
        });
        for event in events {
            self.publish(event);
        }
        result
    }

    fn publish(&self, event: ConversationEvent) {
        match event {
            ConversationEvent::SendComplete(result) => self.completion.signal(result),
            ConversationEvent::Reply(result) => self.reply.signal(result),
            ConversationEvent::Received(result) => {
                if let Err(TrySendError::Full(_dropped)) = self.datagrams.try_send(result) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("Datagram queue full, dropping inbound datagram");
                }
            }
        }
    }
}
