//! Error definitions shared across library modules.
//! Each type models a specific failure scenario (CAN ID construction, PCI
//! encoding/decoding, configuration, transfer outcome, scheduler fault).
use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors that can occur while building a 29-bit addressed CAN identifier.
pub enum CanIdBuildError {
    /// Physical addressing requires distinct target and source.
    #[error("Target and source address are both {address:#04X}")]
    SameTargetAndSource { address: u8 },
    /// The composed value does not fit in 29 bits.
    #[error("Identifier {raw:#X} exceeds 29 bits")]
    OutOfRange { raw: u32 },
}

//================================================================================CODEC_ERROR

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Issues encountered while encoding or decoding protocol control information.
pub enum CodecError {
    /// Frame identifier differs from the endpoint receive identifier.
    #[error("CAN identifier does not match the endpoint")]
    IdMismatch,
    /// Address-extension byte differs from the configured address.
    #[error("Address extension mismatch: expected {expected:#04X}, found {found:#04X}")]
    AddressMismatch { expected: u8, found: u8 },
    /// Frame is shorter than its PCI requires.
    #[error("Truncated frame: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },
    /// Type nibble outside SF/FF/CF/FC.
    #[error("Unknown PCI type nibble {nibble:#X}")]
    UnknownFrameType { nibble: u8 },
    /// Single-frame length is zero, too large, or escaped outside CAN FD.
    #[error("Invalid single frame length {len}")]
    InvalidSingleFrameLength { len: usize },
    /// First-frame length is too small to need segmentation.
    #[error("Invalid first frame length {len}")]
    InvalidFirstFrameLength { len: u32 },
    /// 32-bit first-frame length outside CAN FD.
    #[error("Escalated first frame length requires CAN FD")]
    EscalatedLengthNotAllowed,
    /// Reserved flow status value.
    #[error("Invalid flow status {value}")]
    InvalidFlowStatus { value: u8 },
    /// Reserved STmin encoding.
    #[error("Invalid STmin byte {value:#04X}")]
    InvalidStMin { value: u8 },
    /// Payload does not fit in the frame being built.
    #[error("Payload of {len} bytes does not fit, capacity {capacity}")]
    PayloadTooLarge { len: usize, capacity: usize },
}

//================================================================================CONFIG_ERROR

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Rejected option combinations.
pub enum ConfigError {
    /// Maximum datagram is zero or beyond what the frame mode can announce.
    #[error("Invalid maximum datagram length {len}")]
    InvalidMaxDatagram { len: usize },
    /// STmin cannot be expressed on the wire.
    #[error("STmin of {micros} us cannot be encoded")]
    UnencodableStMin { micros: u64 },
    /// A timing parameter is zero.
    #[error("Timing parameter must be non-zero")]
    ZeroTiming,
    /// Frame pool cannot hold a data frame plus a flow control.
    #[error("Frame pool capacity {capacity} is too small")]
    PoolTooSmall { capacity: usize },
    /// Transmit and receive identifiers are identical.
    #[error("Transmit and receive identifiers must differ")]
    MirroredIds,
    /// Extended or mixed addressing without an address byte.
    #[error("Addressing mode requires target and source address bytes")]
    MissingAddress,
}

//================================================================================TRANSFER_ERROR

/// The six ISO 15765-2 timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TimeoutKind {
    /// Sender: frame not confirmed on the bus in time.
    As,
    /// Receiver: flow control not confirmed on the bus in time.
    Ar,
    /// Sender: no flow control received after a FF or a block.
    Bs,
    /// Receiver: next flow control could not be issued in time.
    Br,
    /// Sender: next consecutive frame not submitted in time.
    Cs,
    /// Receiver: no consecutive frame received in time.
    Cr,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// Outcome of a failed send or receive on one conversation.
pub enum IsoTpError {
    /// One of the six timing parameters elapsed.
    #[error("Timeout on N_{0:?}")]
    Timeout(TimeoutKind),
    /// Consecutive frame out of order.
    #[error("Wrong sequence number: expected {expected}, found {found}")]
    WrongSequenceNumber { expected: u8, found: u8 },
    /// Malformed PCI or a codec-level rejection.
    #[error("Malformed frame: {0}")]
    Malformed(CodecError),
    /// Received bytes disagree with the announced length.
    #[error("Length mismatch: declared {declared}, received {received}")]
    LengthMismatch { declared: u32, received: u32 },
    /// A new SF/FF interrupted the transfer in progress.
    #[error("Transfer interrupted by a new first or single frame")]
    Interrupted,
    /// Peer answered OVFLW, or the announced length exceeds the local cap.
    #[error("Buffer overflow")]
    Overflow,
    /// Too many consecutive WT flow controls.
    #[error("Wait frame limit exceeded")]
    WaitLimitExceeded,
    /// A transfer is already in progress (or failed and not reset).
    #[error("Conversation busy")]
    Busy,
    /// Payload cannot be carried by the configured frame mode.
    #[error("Payload of {len} bytes exceeds {max}")]
    PayloadTooLarge { len: usize, max: usize },
    /// The driver accepted zero frames.
    #[error("CAN bus rejected the frame")]
    BusRejected,
    /// The bus receive loop reported a fault; the scheduler stopped.
    #[error("Background bus fault")]
    BusFault,
    /// Conversation pool has no free frame buffer.
    #[error("Frame pool exhausted")]
    PoolExhausted,
    /// Transfer cancelled by the application.
    #[error("Transfer cancelled")]
    Cancelled,
    /// No reply datagram arrived before the request timeout.
    #[error("No response before timeout")]
    ResponseTimeout,
    /// Another registered conversation already uses this endpoint.
    #[error("Endpoint already registered")]
    DuplicateEndpoint,
    /// Conversation is not registered with a running scheduler.
    #[error("Conversation not registered")]
    NotRegistered,
}

impl IsoTpError {
    /// Whether repeating the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IsoTpError::Timeout(_)
                | IsoTpError::Busy
                | IsoTpError::PoolExhausted
                | IsoTpError::ResponseTimeout
                | IsoTpError::Interrupted
        )
    }
}

impl From<CodecError> for IsoTpError {
    fn from(err: CodecError) -> Self {
        IsoTpError::Malformed(err)
    }
}

//==================================================================================SCHEDULER_ERROR
#[derive(Debug, Error)]
/// Fatal errors that stop the scheduler loop.
pub enum SchedulerError<E: core::fmt::Debug> {
    /// Background fault reported by the bus receive path.
    #[error("CAN bus fault: {0:?}")]
    Bus(E),
}
