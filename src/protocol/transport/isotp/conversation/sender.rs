//! Send state machine: single frame, or first frame followed by consecutive
//! frames paced by the peer's flow control.
use alloc::vec::Vec;
use embassy_time::{Duration, Instant};

use super::{ConversationCore, ConversationEvent, DataKind, FrameRole};
use crate::error::{IsoTpError, TimeoutKind};
use crate::protocol::transport::isotp::codec::{self, FlowStatus};
use crate::protocol::transport::isotp::timing::Deadline;

/// Progress of the outbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxState {
    Idle,
    /// First frame queued, waiting for the first flow control.
    WaitFc,
    /// Sending consecutive frames.
    SendCf,
    /// Block complete, waiting for the next flow control.
    WaitFcAfterBlock,
    /// Terminal until [`ConversationCore::reset`].
    Failed,
}

#[derive(Debug)]
pub(super) struct TxMachine {
    pub(super) state: TxState,
    /// Bumped for every transfer; stale confirmations carry an older value.
    pub(super) generation: u32,
    /// A single frame is queued or in flight (the state stays `Idle`).
    single_pending: bool,
    payload: Vec<u8>,
    bytes_queued: usize,
    bytes_confirmed: usize,
    sequence: u8,
    block_size: u8,
    block_counter: u8,
    st_min: Duration,
    wait_count: u8,
    last_cf_at: Option<Instant>,
    n_bs: Deadline,
    pub(super) n_cs: Deadline,
}

impl TxMachine {
    pub(super) fn new() -> Self {
        Self {
            state: TxState::Idle,
            generation: 0,
            single_pending: false,
            payload: Vec::new(),
            bytes_queued: 0,
            bytes_confirmed: 0,
            sequence: 1,
            block_size: 0,
            block_counter: 0,
            st_min: Duration::from_micros(0),
            wait_count: 0,
            last_cf_at: None,
            n_bs: Deadline::new(),
            n_cs: Deadline::new(),
        }
    }

    /// A transfer is in progress.
    pub(super) fn is_active(&self) -> bool {
        self.single_pending
            || matches!(
                self.state,
                TxState::WaitFc | TxState::SendCf | TxState::WaitFcAfterBlock
            )
    }

    pub(super) fn is_waiting_flow_control(&self) -> bool {
        matches!(self.state, TxState::WaitFc | TxState::WaitFcAfterBlock)
    }

    /// Leave `Failed`. Returns whether the state changed.
    pub(super) fn clear_failure(&mut self) -> bool {
        if self.state == TxState::Failed {
            self.state = TxState::Idle;
            true
        } else {
            false
        }
    }

    fn finish(&mut self, state: TxState) {
        self.state = state;
        self.single_pending = false;
        self.payload = Vec::new();
        self.bytes_queued = 0;
        self.bytes_confirmed = 0;
        self.n_bs.disarm();
        self.n_cs.disarm();
    }
}

impl ConversationCore {
    /// Start sending `payload`.
    ///
    /// Fails with `Busy` while a transfer is in progress or the previous one
    /// failed and was not reset, and with `PayloadTooLarge` when the frame
    /// mode cannot announce the length.
    pub fn begin_send(&mut self, payload: &[u8]) -> Result<(), IsoTpError> {
        if self.tx.state != TxState::Idle || self.tx.single_pending {
            return Err(IsoTpError::Busy);
        }
        let mode = self.options.mode;
        let total = payload.len();
        let max = mode.max_datagram();
        if total > max {
            return Err(IsoTpError::PayloadTooLarge { len: total, max });
        }

        self.tx.generation = self.tx.generation.wrapping_add(1);

        if total <= codec::single_frame_capacity(&self.endpoint, mode) {
            self.enqueue_data(DataKind::Single, |endpoint, options, frame| {
                codec::encode_single(endpoint, options.mode, options.padding, payload, frame)
            })?;
            self.tx.single_pending = true;
            return Ok(());
        }

        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(total)
            .map_err(|_| IsoTpError::PayloadTooLarge { len: total, max })?;
        buffer.extend_from_slice(payload);

        let first_len = codec::first_frame_capacity(&self.endpoint, mode, total);
        self.enqueue_data(DataKind::First { len: first_len }, |endpoint, options, frame| {
            codec::encode_first(
                endpoint,
                options.mode,
                options.padding,
                total,
                &payload[..first_len],
                frame,
            )
        })?;

        let tx = &mut self.tx;
        tx.payload = buffer;
        tx.bytes_queued = first_len;
        tx.bytes_confirmed = 0;
        tx.sequence = 1;
        tx.block_counter = 0;
        tx.wait_count = 0;
        tx.last_cf_at = None;
        tx.state = TxState::WaitFc;

        #[cfg(feature = "defmt")]
        defmt::debug!("TX: first frame queued, {} bytes total", total);
        Ok(())
    }

    /// Return a failed sender to `Idle`. Returns `false` when it was not failed.
    pub fn reset(&mut self) -> bool {
        self.tx.clear_failure()
    }

    pub(super) fn on_flow_control(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
        now: Instant,
    ) {
        if !self.tx.is_waiting_flow_control() {
            #[cfg(feature = "defmt")]
            defmt::trace!("TX: unexpected flow control ignored in {}", self.tx.state);
            return;
        }

        match status {
            FlowStatus::ContinueToSend => {
                let st_min = match codec::decode_st_min(st_min) {
                    Ok(st_min) => st_min,
                    Err(err) => {
                        self.fail_tx(IsoTpError::Malformed(err));
                        return;
                    }
                };
                let tx = &mut self.tx;
                tx.block_size = block_size;
                tx.block_counter = 0;
                tx.wait_count = 0;
                tx.st_min = st_min;
                tx.last_cf_at = None;
                tx.state = TxState::SendCf;
                tx.n_bs.disarm();
                tx.n_cs.arm(now, self.options.timing.n_cs);
            }
            FlowStatus::Wait => {
                self.tx.wait_count = self.tx.wait_count.saturating_add(1);
                if self.tx.wait_count > self.options.max_wait_frames {
                    self.fail_tx(IsoTpError::WaitLimitExceeded);
                } else {
                    self.tx.n_bs.arm(now, self.options.timing.n_bs);
                }
            }
            FlowStatus::Overflow => self.fail_tx(IsoTpError::Overflow),
        }
    }

    pub(super) fn poll_tx(&mut self, now: Instant) {
        match self.tx.state {
            TxState::WaitFc | TxState::WaitFcAfterBlock => {
                if self.tx.n_bs.is_expired(now) {
                    self.fail_tx(IsoTpError::Timeout(TimeoutKind::Bs));
                }
            }
            TxState::SendCf => {
                if self.tx.n_cs.is_expired(now) {
                    self.fail_tx(IsoTpError::Timeout(TimeoutKind::Cs));
                } else {
                    self.segment_next(now);
                }
            }
            TxState::Idle | TxState::Failed => {}
        }
    }

    /// Queue the next consecutive frame once the previous one is confirmed and
    /// STmin has elapsed since its confirmation.
    fn segment_next(&mut self, now: Instant) {
        let total = self.tx.payload.len();
        if self.tx.bytes_queued >= total || self.data_outstanding() {
            return;
        }
        if let Some(last) = self.tx.last_cf_at {
            if now < last + self.tx.st_min {
                return;
            }
        }

        let capacity = codec::consecutive_frame_capacity(&self.endpoint, self.options.mode);
        let start = self.tx.bytes_queued;
        let end = (start + capacity).min(total);
        let sequence = self.tx.sequence;

        let payload = core::mem::take(&mut self.tx.payload);
        let queued = self.enqueue_data(
            DataKind::Consecutive { len: end - start },
            |endpoint, options, frame| {
                codec::encode_consecutive(
                    endpoint,
                    options.mode,
                    options.padding,
                    sequence,
                    &payload[start..end],
                    frame,
                )
            },
        );
        self.tx.payload = payload;

        match queued {
            Ok(()) => {}
            // Retried on the next poll; N_Cs bounds the wait.
            Err(IsoTpError::PoolExhausted) => return,
            Err(err) => {
                self.fail_tx(err);
                return;
            }
        }

        let tx = &mut self.tx;
        tx.sequence = (sequence + 1) & 0x0F;
        tx.bytes_queued = end;
        tx.block_counter = tx.block_counter.wrapping_add(1);
        if end < total && tx.block_size != 0 && tx.block_counter == tx.block_size {
            tx.state = TxState::WaitFcAfterBlock;
        }
    }

    /// A data frame of this transfer is queued or awaiting confirmation.
    fn data_outstanding(&self) -> bool {
        !self.pending_data.is_empty()
            || self
                .in_flight
                .iter()
                .any(|entry| matches!(entry.role, FrameRole::Data { .. }))
    }

    pub(super) fn confirm_data(&mut self, kind: DataKind, generation: u32, now: Instant) {
        if generation != self.tx.generation {
            return;
        }
        let timing = self.options.timing;

        match kind {
            DataKind::Single => {
                if self.tx.single_pending {
                    self.complete_tx();
                }
            }
            DataKind::First { len } => {
                self.tx.bytes_confirmed += len;
                if self.tx.state == TxState::WaitFc {
                    self.tx.n_bs.arm(now, timing.n_bs);
                }
            }
            DataKind::Consecutive { len } => {
                let tx = &mut self.tx;
                tx.bytes_confirmed += len;
                tx.last_cf_at = Some(now);
                if tx.bytes_confirmed >= tx.payload.len() {
                    self.complete_tx();
                } else if tx.state == TxState::WaitFcAfterBlock {
                    tx.n_bs.arm(now, timing.n_bs);
                } else if tx.state == TxState::SendCf {
                    tx.n_cs.arm(now, tx.st_min + timing.n_cs);
                }
            }
        }
    }

    fn complete_tx(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::debug!("TX: transfer complete");

        self.tx.finish(TxState::Idle);
        self.events.push(ConversationEvent::SendComplete(Ok(())));
    }

    pub(super) fn fail_tx(&mut self, err: IsoTpError) {
        #[cfg(feature = "defmt")]
        defmt::warn!("TX: transfer failed: {}", err);

        self.drop_data_frames();
        self.tx.finish(TxState::Failed);
        self.tx.generation = self.tx.generation.wrapping_add(1);
        self.events.push(ConversationEvent::SendComplete(Err(err)));
    }
}
