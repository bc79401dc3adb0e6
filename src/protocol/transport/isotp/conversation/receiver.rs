//! Receive state machine: immediate single-frame delivery, or reassembly of a
//! first frame and its consecutive frames under our flow-control policy.
use alloc::vec::Vec;
use embassy_time::Instant;

use super::{ConversationCore, Datagram};
use crate::error::{IsoTpError, TimeoutKind};
use crate::protocol::transport::isotp::codec::FlowStatus;
use crate::protocol::transport::isotp::timing::Deadline;

/// Progress of the inbound transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    Idle,
    /// Reassembling consecutive frames.
    RecvCf,
    /// Last transfer failed; the next SF or FF starts over.
    Failed,
}

#[derive(Debug)]
pub(super) struct RxMachine {
    pub(super) state: RxState,
    /// Bumped for every transfer; stale flow-control confirmations carry an older value.
    pub(super) generation: u32,
    pub(super) buffer: Vec<u8>,
    total: usize,
    expected_sequence: u8,
    block_counter: u8,
    /// WT frames still to send before the next CTS.
    waits_left: u8,
    n_cr: Deadline,
    n_br: Deadline,
    /// Armed while a due flow control could not be queued; bounded by N_Br.
    fc_due: Deadline,
}

impl RxMachine {
    pub(super) fn new() -> Self {
        Self {
            state: RxState::Idle,
            generation: 0,
            buffer: Vec::new(),
            total: 0,
            expected_sequence: 1,
            block_counter: 0,
            waits_left: 0,
            n_cr: Deadline::new(),
            n_br: Deadline::new(),
            fc_due: Deadline::new(),
        }
    }

    fn finish(&mut self, state: RxState) {
        self.state = state;
        self.total = 0;
        self.waits_left = 0;
        self.n_cr.disarm();
        self.n_br.disarm();
        self.fc_due.disarm();
    }
}

impl ConversationCore {
    pub(super) fn on_single(&mut self, payload: &[u8]) {
        self.interrupt_reception();
        self.rx.state = RxState::Idle;
        self.deliver(Ok(Datagram {
            payload: payload.to_vec(),
        }));
    }

    pub(super) fn on_first(&mut self, len: u32, payload: &[u8], now: Instant) {
        self.interrupt_reception();
        self.rx.state = RxState::Idle;
        self.rx.generation = self.rx.generation.wrapping_add(1);

        let total = match usize::try_from(len) {
            Ok(total) if total <= self.options.rx.max_datagram_len => total,
            _ => {
                self.reject_oversized();
                return;
            }
        };
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(total).is_err() {
            self.reject_oversized();
            return;
        }
        buffer.extend_from_slice(&payload[..payload.len().min(total)]);

        #[cfg(feature = "defmt")]
        defmt::debug!("RX: first frame, {} bytes announced", total);

        let rx = &mut self.rx;
        rx.buffer = buffer;
        rx.total = total;
        rx.expected_sequence = 1;
        rx.block_counter = 0;
        rx.state = RxState::RecvCf;
        self.start_flow_control(now);
    }

    pub(super) fn on_consecutive(&mut self, sequence: u8, payload: &[u8], now: Instant) {
        if self.rx.state != RxState::RecvCf {
            #[cfg(feature = "defmt")]
            defmt::trace!("RX: consecutive frame ignored in {}", self.rx.state);
            return;
        }
        if sequence != self.rx.expected_sequence {
            self.fail_rx(IsoTpError::WrongSequenceNumber {
                expected: self.rx.expected_sequence,
                found: sequence,
            });
            return;
        }
        if payload.is_empty() {
            self.fail_rx(IsoTpError::LengthMismatch {
                declared: self.rx.total as u32,
                received: self.rx.buffer.len() as u32,
            });
            return;
        }

        let rx = &mut self.rx;
        let remaining = rx.total - rx.buffer.len();
        rx.buffer
            .extend_from_slice(&payload[..payload.len().min(remaining)]);
        rx.expected_sequence = (rx.expected_sequence + 1) & 0x0F;
        rx.block_counter = rx.block_counter.wrapping_add(1);

        if rx.buffer.len() == rx.total {
            self.complete_rx();
            return;
        }

        rx.n_cr.arm(now, self.options.timing.n_cr);
        let block_size = self.options.rx.block_size;
        if block_size != 0 && rx.block_counter == block_size {
            rx.block_counter = 0;
            self.start_flow_control(now);
        }
    }

    pub(super) fn poll_rx(&mut self, now: Instant) {
        if self.rx.state != RxState::RecvCf {
            return;
        }
        if self.rx.n_cr.is_expired(now) {
            self.fail_rx(IsoTpError::Timeout(TimeoutKind::Cr));
        } else if self.rx.fc_due.is_armed() {
            if self.rx.fc_due.is_expired(now) {
                self.fail_rx(IsoTpError::Timeout(TimeoutKind::Br));
            } else {
                self.issue_flow_control(now);
            }
        } else if self.rx.n_br.take_expired(now) {
            self.issue_flow_control(now);
        }
    }

    pub(super) fn confirm_flow_control(&mut self, status: FlowStatus, generation: u32, now: Instant) {
        if generation != self.rx.generation || self.rx.state != RxState::RecvCf {
            return;
        }
        if status == FlowStatus::ContinueToSend {
            self.rx.n_cr.arm(now, self.options.timing.n_cr);
        }
    }

    /// Begin the flow-control exchange for a block: WT frames first when the
    /// policy asks for them, then CTS.
    fn start_flow_control(&mut self, now: Instant) {
        self.rx.waits_left = self.options.rx.effective_wait_frames();
        self.issue_flow_control(now);
    }

    /// Queue the next flow control of the exchange. Without a free frame the
    /// attempt is repeated on every poll until N_Br runs out.
    fn issue_flow_control(&mut self, now: Instant) {
        let timing = self.options.timing;
        let status = if self.rx.waits_left > 0 {
            FlowStatus::Wait
        } else {
            FlowStatus::ContinueToSend
        };
        match self.enqueue_flow_control(status) {
            Ok(()) => {
                let rx = &mut self.rx;
                rx.fc_due.disarm();
                if status == FlowStatus::Wait {
                    rx.waits_left -= 1;
                    rx.n_br.arm(now, timing.n_br);
                    rx.n_cr.disarm();
                } else {
                    rx.n_br.disarm();
                    rx.n_cr.arm(now, timing.n_cr);
                }
            }
            Err(IsoTpError::PoolExhausted) => {
                #[cfg(feature = "defmt")]
                defmt::debug!("RX: no frame for flow control, retrying");

                let rx = &mut self.rx;
                if !rx.fc_due.is_armed() {
                    rx.fc_due.arm(now, timing.n_br);
                }
                rx.n_br.disarm();
                rx.n_cr.disarm();
            }
            Err(err) => self.fail_rx(err),
        }
    }

    /// Answer OVFLW without allocating anything.
    fn reject_oversized(&mut self) {
        self.fail_rx(IsoTpError::Overflow);
        if let Err(_err) = self.enqueue_flow_control(FlowStatus::Overflow) {
            #[cfg(feature = "defmt")]
            defmt::warn!("RX: could not queue overflow flow control: {}", _err);
        }
    }

    /// A new SF or FF ends the reassembly in progress.
    fn interrupt_reception(&mut self) {
        if self.rx.state == RxState::RecvCf {
            self.fail_rx(IsoTpError::Interrupted);
        }
    }

    fn complete_rx(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::debug!("RX: datagram complete, {} bytes", self.rx.total);

        let payload = core::mem::take(&mut self.rx.buffer);
        self.rx.finish(RxState::Idle);
        self.deliver(Ok(Datagram { payload }));
    }

    pub(super) fn fail_rx(&mut self, err: IsoTpError) {
        #[cfg(feature = "defmt")]
        defmt::warn!("RX: transfer failed: {}", err);

        self.drop_flow_controls();
        self.rx.buffer = Vec::new();
        self.rx.finish(RxState::Failed);
        self.rx.generation = self.rx.generation.wrapping_add(1);
        self.deliver(Err(err));
    }
}
