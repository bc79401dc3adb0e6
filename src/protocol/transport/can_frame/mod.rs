//! In-memory representation of a classic CAN or CAN FD frame.
use crate::protocol::transport::can_id::CanId;
use embedded_can::Id;

/// Largest classic CAN payload.
pub const CLASSIC_DATA_LEN: usize = 8;
/// Largest CAN FD payload.
pub const FD_DATA_LEN: usize = 64;

/// Payload lengths a CAN FD data length code can express above eight bytes.
const FD_LENGTH_STEPS: [usize; 7] = [12, 16, 20, 24, 32, 48, 64];

/// Smallest valid frame length able to hold `len` bytes, or `None` above 64.
///
/// Classic lengths (0 to 8) are returned unchanged.
pub fn fd_frame_len(len: usize) -> Option<usize> {
    if len <= CLASSIC_DATA_LEN {
        return Some(len);
    }
    FD_LENGTH_STEPS.iter().copied().find(|step| *step >= len)
}

#[derive(Clone, Copy, Debug)]
/// Raw frame as read from or written to the CAN bus.
///
/// Equality looks at what goes on the wire: identifier, format and
/// `data[..len]`. Bytes past `len` are ignored.
pub struct CanFrame {
    /// Identifier and frame format.
    pub id: CanId,
    /// Payload buffer, sized for CAN FD. Only `data[..len]` is meaningful.
    pub data: [u8; FD_DATA_LEN],
    /// Number of valid payload bytes.
    pub len: usize,
    /// Set for CAN FD frames.
    pub fd: bool,
}

impl CanFrame {
    /// Build a frame from a payload slice. Payloads above eight bytes are
    /// marked as CAN FD; `None` above 64 bytes or for an invalid FD length.
    pub fn new(id: CanId, payload: &[u8]) -> Option<Self> {
        let len = payload.len();
        if fd_frame_len(len)? != len {
            return None;
        }
        let mut data = [0u8; FD_DATA_LEN];
        data[..len].copy_from_slice(payload);
        Some(Self {
            id,
            data,
            len,
            fd: len > CLASSIC_DATA_LEN,
        })
    }

    /// Empty frame of the given format, used as an encode target.
    pub const fn empty(id: CanId, fd: bool) -> Self {
        Self {
            id,
            data: [0u8; FD_DATA_LEN],
            len: 0,
            fd,
        }
    }

    /// Valid payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len.min(FD_DATA_LEN)]
    }
}

impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.fd == other.fd && self.payload() == other.payload()
    }
}

impl Eq for CanFrame {}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        CanFrame::new(CanId::from(id.into()), data)
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        // ISO-TP never uses remote frames.
        None
    }

    fn is_extended(&self) -> bool {
        self.id.is_extended()
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        self.id.into()
    }

    fn dlc(&self) -> usize {
        self.len
    }

    fn data(&self) -> &[u8] {
        self.payload()
    }
}
