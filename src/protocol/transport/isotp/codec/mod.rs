//! Stateless PCI codec: converts between raw CAN payloads and the protocol
//! control information of the four ISO-TP frame kinds.
//!
//! Byte layout (after the optional address byte):
//!
//! ```text
//! SF   0000 LLLL [data]                 classic, 1 ≤ L ≤ 7
//! SF   0000 0000  LLLLLLLL [data]       CAN FD escape
//! FF   0001 LLLL  LLLLLLLL [data]       12-bit length
//! FF   0001 0000  00000000 L32 (BE) [data]  escalated length, CAN FD only
//! CF   0010 SSSS [data]                 S = sequence number mod 16
//! FC   0011 FFFF  BS  STmin             F = 0 CTS, 1 WT, 2 OVFLW
//! ```
use embassy_time::Duration;

use crate::error::CodecError;
use crate::protocol::transport::can_frame::{fd_frame_len, CanFrame, CLASSIC_DATA_LEN};
use crate::protocol::transport::isotp::endpoint::Endpoint;
use crate::protocol::transport::isotp::options::FrameMode;
use crate::protocol::transport::isotp::MAX_CLASSIC_DATAGRAM;

/// Filler used for CAN FD length rounding when no padding byte is configured.
pub const DEFAULT_FD_FILL: u8 = 0xCC;

//==================================================================================PCI
/// The four ISO-TP frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameType {
    Single = 0,
    First = 1,
    Consecutive = 2,
    FlowControl = 3,
}

/// Flow status carried by a flow-control frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlowStatus {
    ContinueToSend = 0,
    Wait = 1,
    Overflow = 2,
}

impl FlowStatus {
    fn from_nibble(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(FlowStatus::ContinueToSend),
            1 => Ok(FlowStatus::Wait),
            2 => Ok(FlowStatus::Overflow),
            value => Err(CodecError::InvalidFlowStatus { value }),
        }
    }
}

/// Protocol control information of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pci {
    Single {
        len: usize,
    },
    First {
        len: u32,
    },
    Consecutive {
        sequence: u8,
    },
    /// `block_size` and raw `st_min` are passed through unvalidated.
    FlowControl {
        status: FlowStatus,
        block_size: u8,
        st_min: u8,
    },
}

impl Pci {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Pci::Single { .. } => FrameType::Single,
            Pci::First { .. } => FrameType::First,
            Pci::Consecutive { .. } => FrameType::Consecutive,
            Pci::FlowControl { .. } => FrameType::FlowControl,
        }
    }
}

/// A decoded frame: its PCI and a view over the data bytes following it.
///
/// For SF the view is exactly the announced length. For FF and CF it is the
/// rest of the frame; the receiver caps it by the remaining transfer length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame<'a> {
    pub pci: Pci,
    pub payload: &'a [u8],
}

//==================================================================================CAPACITIES
/// Largest payload carried by a single frame.
pub fn single_frame_capacity(endpoint: &Endpoint, mode: FrameMode) -> usize {
    match mode {
        FrameMode::Classic => CLASSIC_DATA_LEN - 1 - endpoint.extension_len(),
        FrameMode::Fd => mode.frame_capacity() - 2 - endpoint.extension_len(),
    }
}

/// Data bytes carried by the first frame of a `total`-byte datagram.
pub fn first_frame_capacity(endpoint: &Endpoint, mode: FrameMode, total: usize) -> usize {
    let header = if total > MAX_CLASSIC_DATAGRAM { 6 } else { 2 };
    mode.frame_capacity() - endpoint.extension_len() - header
}

/// Data bytes carried by one consecutive frame.
pub fn consecutive_frame_capacity(endpoint: &Endpoint, mode: FrameMode) -> usize {
    mode.frame_capacity() - endpoint.extension_len() - 1
}

/// Short (one-byte) SF form limit, also the classic first-frame threshold.
fn short_single_capacity(endpoint: &Endpoint) -> usize {
    CLASSIC_DATA_LEN - 1 - endpoint.extension_len()
}

/// SF capacity of a received frame whose PCI starts `data`.
fn received_single_capacity(endpoint: &Endpoint, data: &[u8]) -> usize {
    if data.len() + endpoint.extension_len() <= CLASSIC_DATA_LEN {
        short_single_capacity(endpoint)
    } else {
        data.len() - 2
    }
}

//==================================================================================DECODE
/// Decode a frame received for `endpoint`.
pub fn decode<'a>(
    endpoint: &Endpoint,
    mode: FrameMode,
    frame: &'a CanFrame,
) -> Result<DecodedFrame<'a>, CodecError> {
    if frame.id != endpoint.rx_id {
        return Err(CodecError::IdMismatch);
    }

    let mut data = frame.payload();
    if let Some(expected) = endpoint.rx_extension() {
        let (&found, rest) = data.split_first().ok_or(CodecError::Truncated {
            needed: 1,
            available: 0,
        })?;
        if found != expected {
            return Err(CodecError::AddressMismatch { expected, found });
        }
        data = rest;
    }

    let first = *data.first().ok_or(CodecError::Truncated {
        needed: 1,
        available: 0,
    })?;
    let low = first & 0x0F;

    match first >> 4 {
        0 => decode_single(endpoint, mode, low, data),
        1 => decode_first(endpoint, mode, low, data),
        2 => Ok(DecodedFrame {
            pci: Pci::Consecutive { sequence: low },
            payload: &data[1..],
        }),
        3 => {
            ensure_len(data, 3)?;
            Ok(DecodedFrame {
                pci: Pci::FlowControl {
                    status: FlowStatus::from_nibble(low)?,
                    block_size: data[1],
                    st_min: data[2],
                },
                payload: &[],
            })
        }
        nibble => Err(CodecError::UnknownFrameType { nibble }),
    }
}

fn decode_single<'a>(
    endpoint: &Endpoint,
    mode: FrameMode,
    low: u8,
    data: &'a [u8],
) -> Result<DecodedFrame<'a>, CodecError> {
    let (len, header) = if low != 0 {
        let len = low as usize;
        if len > short_single_capacity(endpoint) {
            return Err(CodecError::InvalidSingleFrameLength { len });
        }
        (len, 1)
    } else {
        // Zero in the low nibble is the CAN FD escape; classic SFs cannot be empty.
        if !mode.is_fd() {
            return Err(CodecError::InvalidSingleFrameLength { len: 0 });
        }
        ensure_len(data, 2)?;
        let len = data[1] as usize;
        if len > single_frame_capacity(endpoint, mode) {
            return Err(CodecError::InvalidSingleFrameLength { len });
        }
        (len, 2)
    };

    ensure_len(data, header + len)?;
    Ok(DecodedFrame {
        pci: Pci::Single { len },
        payload: &data[header..header + len],
    })
}

fn decode_first<'a>(
    endpoint: &Endpoint,
    mode: FrameMode,
    low: u8,
    data: &'a [u8],
) -> Result<DecodedFrame<'a>, CodecError> {
    ensure_len(data, 2)?;
    let short_len = ((low as u32) << 8) | data[1] as u32;

    let (len, header) = if short_len != 0 {
        // A length the frame itself could have carried as an SF is invalid.
        if short_len as usize <= received_single_capacity(endpoint, data) {
            return Err(CodecError::InvalidFirstFrameLength { len: short_len });
        }
        (short_len, 2)
    } else {
        if !mode.is_fd() {
            return Err(CodecError::EscalatedLengthNotAllowed);
        }
        ensure_len(data, 6)?;
        let len = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        if len as usize <= MAX_CLASSIC_DATAGRAM {
            return Err(CodecError::InvalidFirstFrameLength { len });
        }
        (len, 6)
    };

    Ok(DecodedFrame {
        pci: Pci::First { len },
        payload: &data[header..],
    })
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), CodecError> {
    if data.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: data.len(),
        });
    }
    Ok(())
}

//==================================================================================ENCODE
/// Bounds-checked cursor over a frame being built.
struct FrameWriter<'a> {
    frame: &'a mut CanFrame,
    capacity: usize,
    cursor: usize,
}

impl<'a> FrameWriter<'a> {
    /// Start a frame for `endpoint`, writing the address byte if required.
    fn start(frame: &'a mut CanFrame, endpoint: &Endpoint, mode: FrameMode) -> Self {
        frame.id = endpoint.tx_id;
        frame.fd = mode.is_fd();
        frame.len = 0;
        // Pooled slots are reused; nothing of the previous frame may remain.
        frame.data.fill(0);
        let mut writer = Self {
            frame,
            capacity: mode.frame_capacity(),
            cursor: 0,
        };
        if let Some(address) = endpoint.tx_extension() {
            writer.frame.data[0] = address;
            writer.cursor = 1;
        }
        writer
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let end = self.cursor + bytes.len();
        if end > self.capacity {
            return Err(CodecError::PayloadTooLarge {
                len: bytes.len(),
                capacity: self.capacity - self.cursor,
            });
        }
        self.frame.data[self.cursor..end].copy_from_slice(bytes);
        self.cursor = end;
        Ok(())
    }

    /// Apply the padding policy and fix the frame length.
    fn finish(self, mode: FrameMode, padding: Option<u8>) {
        let used = self.cursor;
        let target = match (mode, padding) {
            (FrameMode::Classic, Some(_)) => CLASSIC_DATA_LEN,
            (FrameMode::Classic, None) => used,
            (FrameMode::Fd, Some(_)) => fd_frame_len(used.max(CLASSIC_DATA_LEN)).unwrap_or(used),
            (FrameMode::Fd, None) => fd_frame_len(used).unwrap_or(used),
        };
        let fill = padding.unwrap_or(DEFAULT_FD_FILL);
        self.frame.data[used..target].fill(fill);
        self.frame.len = target;
    }
}

/// Build a single frame carrying all of `payload`.
pub fn encode_single(
    endpoint: &Endpoint,
    mode: FrameMode,
    padding: Option<u8>,
    payload: &[u8],
    out: &mut CanFrame,
) -> Result<(), CodecError> {
    let len = payload.len();
    let capacity = single_frame_capacity(endpoint, mode);
    if len > capacity {
        return Err(CodecError::PayloadTooLarge { len, capacity });
    }

    let mut writer = FrameWriter::start(out, endpoint, mode);
    if len > 0 && len <= short_single_capacity(endpoint) {
        writer.put(&[len as u8])?;
    } else if mode.is_fd() {
        writer.put(&[0x00, len as u8])?;
    } else {
        return Err(CodecError::InvalidSingleFrameLength { len });
    }
    writer.put(payload)?;
    writer.finish(mode, padding);
    Ok(())
}

/// Build the first frame of a `total`-byte datagram carrying `chunk`.
pub fn encode_first(
    endpoint: &Endpoint,
    mode: FrameMode,
    padding: Option<u8>,
    total: usize,
    chunk: &[u8],
    out: &mut CanFrame,
) -> Result<(), CodecError> {
    let mut writer = FrameWriter::start(out, endpoint, mode);
    if total <= MAX_CLASSIC_DATAGRAM {
        writer.put(&[0x10 | ((total >> 8) as u8 & 0x0F), (total & 0xFF) as u8])?;
    } else {
        if !mode.is_fd() {
            return Err(CodecError::EscalatedLengthNotAllowed);
        }
        let len = u32::try_from(total).map_err(|_| CodecError::PayloadTooLarge {
            len: total,
            capacity: u32::MAX as usize,
        })?;
        writer.put(&[0x10, 0x00])?;
        writer.put(&len.to_be_bytes())?;
    }
    writer.put(chunk)?;
    writer.finish(mode, padding);
    Ok(())
}

/// Build a consecutive frame.
pub fn encode_consecutive(
    endpoint: &Endpoint,
    mode: FrameMode,
    padding: Option<u8>,
    sequence: u8,
    chunk: &[u8],
    out: &mut CanFrame,
) -> Result<(), CodecError> {
    let mut writer = FrameWriter::start(out, endpoint, mode);
    writer.put(&[0x20 | (sequence & 0x0F)])?;
    writer.put(chunk)?;
    writer.finish(mode, padding);
    Ok(())
}

/// Build a flow-control frame.
pub fn encode_flow_control(
    endpoint: &Endpoint,
    mode: FrameMode,
    padding: Option<u8>,
    status: FlowStatus,
    block_size: u8,
    st_min: u8,
    out: &mut CanFrame,
) -> Result<(), CodecError> {
    let mut writer = FrameWriter::start(out, endpoint, mode);
    writer.put(&[0x30 | status as u8, block_size, st_min])?;
    writer.finish(mode, padding);
    Ok(())
}

//==================================================================================STMIN
/// Decode an STmin byte: `0x00..=0x7F` milliseconds, `0xF1..=0xF9` hundreds of µs.
pub fn decode_st_min(value: u8) -> Result<Duration, CodecError> {
    match value {
        0x00..=0x7F => Ok(Duration::from_millis(value as u64)),
        0xF1..=0xF9 => Ok(Duration::from_micros((value - 0xF0) as u64 * 100)),
        value => Err(CodecError::InvalidStMin { value }),
    }
}

/// Encode a separation time. `None` when it has no exact STmin representation.
pub fn encode_st_min(st_min: Duration) -> Option<u8> {
    let micros = st_min.as_micros();
    if micros % 1000 == 0 && micros / 1000 <= 0x7F {
        return Some((micros / 1000) as u8);
    }
    if (100..=900).contains(&micros) && micros % 100 == 0 {
        return Some(0xF0 + (micros / 100) as u8);
    }
    None
}
