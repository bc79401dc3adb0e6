//! Per-conversation frame arena. Frames are addressed by a [`PooledFrame`]
//! handle that cannot be cloned, so each buffer has exactly one owner: the
//! pending queue, the in-flight table, or the pool free list.
use alloc::vec::Vec;

use crate::error::IsoTpError;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::can_id::CanId;

/// Exclusive handle on one arena slot.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pooled frame must be released back to its pool"]
pub struct PooledFrame {
    slot: usize,
}

impl PooledFrame {
    /// Arena index, stable while the handle is alive.
    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Fixed-capacity arena of CAN frames. Slots are allocated on first use.
#[derive(Debug)]
pub struct FramePool {
    slots: Vec<CanFrame>,
    free: Vec<usize>,
    capacity: usize,
    blank: CanFrame,
}

impl FramePool {
    /// Pool of at most `capacity` frames; fresh slots start addressed to `id`.
    pub fn new(capacity: usize, id: CanId) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            blank: CanFrame::empty(id, false),
        }
    }

    /// Take a free slot, growing the arena up to its capacity.
    pub fn acquire(&mut self) -> Result<PooledFrame, IsoTpError> {
        if let Some(slot) = self.free.pop() {
            return Ok(PooledFrame { slot });
        }
        if self.slots.len() < self.capacity {
            self.slots.push(self.blank);
            return Ok(PooledFrame {
                slot: self.slots.len() - 1,
            });
        }
        Err(IsoTpError::PoolExhausted)
    }

    pub fn frame(&self, handle: &PooledFrame) -> &CanFrame {
        &self.slots[handle.slot]
    }

    pub fn frame_mut(&mut self, handle: &PooledFrame) -> &mut CanFrame {
        &mut self.slots[handle.slot]
    }

    /// Give a slot back. Consumes the handle.
    pub fn release(&mut self, handle: PooledFrame) {
        debug_assert!(!self.free.contains(&handle.slot));
        self.free.push(handle.slot);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently owned by a handle.
    pub fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Slots that `acquire` can still hand out.
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }
}
