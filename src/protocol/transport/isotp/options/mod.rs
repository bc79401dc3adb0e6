//! Conversation configuration: frame mode, padding, bus guard, timing
//! parameters and the receive-side flow-control policy.
use embassy_time::Duration;

use crate::error::{ConfigError, TimeoutKind};
use crate::protocol::transport::isotp::codec::encode_st_min;
use crate::protocol::transport::isotp::{
    DEFAULT_MAX_WAIT_FRAMES, DEFAULT_N_BR_MS, DEFAULT_POOL_CAPACITY, DEFAULT_TIMEOUT_MS,
    MAX_CLASSIC_DATAGRAM, MAX_FD_DATAGRAM,
};

/// Classic CAN (8-byte frames) or CAN FD (up to 64-byte frames).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameMode {
    Classic,
    Fd,
}

impl FrameMode {
    /// Largest frame payload for the mode.
    pub const fn frame_capacity(&self) -> usize {
        match self {
            FrameMode::Classic => 8,
            FrameMode::Fd => 64,
        }
    }

    /// Largest datagram the mode can announce.
    pub const fn max_datagram(&self) -> usize {
        match self {
            FrameMode::Classic => MAX_CLASSIC_DATAGRAM,
            FrameMode::Fd => MAX_FD_DATAGRAM,
        }
    }

    pub const fn is_fd(&self) -> bool {
        matches!(self, FrameMode::Fd)
    }
}

/// The six ISO 15765-2 timing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingParameters {
    pub n_as: Duration,
    pub n_ar: Duration,
    pub n_bs: Duration,
    pub n_br: Duration,
    pub n_cs: Duration,
    pub n_cr: Duration,
}

impl Default for TimingParameters {
    fn default() -> Self {
        let timeout = Duration::from_millis(DEFAULT_TIMEOUT_MS);
        Self {
            n_as: timeout,
            n_ar: timeout,
            n_bs: timeout,
            n_br: Duration::from_millis(DEFAULT_N_BR_MS),
            n_cs: timeout,
            n_cr: timeout,
        }
    }
}

impl TimingParameters {
    /// Value of one parameter.
    pub fn get(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::As => self.n_as,
            TimeoutKind::Ar => self.n_ar,
            TimeoutKind::Bs => self.n_bs,
            TimeoutKind::Br => self.n_br,
            TimeoutKind::Cs => self.n_cs,
            TimeoutKind::Cr => self.n_cr,
        }
    }

    /// Override one parameter.
    pub fn set(&mut self, kind: TimeoutKind, value: Duration) {
        match kind {
            TimeoutKind::As => self.n_as = value,
            TimeoutKind::Ar => self.n_ar = value,
            TimeoutKind::Bs => self.n_bs = value,
            TimeoutKind::Br => self.n_br = value,
            TimeoutKind::Cs => self.n_cs = value,
            TimeoutKind::Cr => self.n_cr = value,
        }
    }
}

/// Flow control we hand out when receiving segmented datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxPolicy {
    /// CFs the peer may send per block (0 = unlimited).
    pub block_size: u8,
    /// Separation time requested from the peer.
    pub st_min: Duration,
    /// Whether WT flow controls may be sent at all.
    pub allow_wait: bool,
    /// WT frames sent (spaced by N_Br) before each CTS when `allow_wait` is set.
    pub wait_frames: u8,
    /// Largest datagram accepted; larger first frames are answered with OVFLW.
    pub max_datagram_len: usize,
}

impl Default for RxPolicy {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: Duration::from_micros(0),
            allow_wait: false,
            wait_frames: 0,
            max_datagram_len: MAX_CLASSIC_DATAGRAM,
        }
    }
}

impl RxPolicy {
    /// Number of WT frames to send before CTS.
    pub fn effective_wait_frames(&self) -> u8 {
        if self.allow_wait {
            self.wait_frames
        } else {
            0
        }
    }
}

/// Complete configuration of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub mode: FrameMode,
    /// Padding byte; `None` sends frames at their natural length
    /// (CAN FD frames above eight bytes are still filled to a valid length).
    pub padding: Option<u8>,
    /// Minimum gap between two data frames on the shared bus.
    pub bus_guard: Option<Duration>,
    pub timing: TimingParameters,
    pub rx: RxPolicy,
    /// Consecutive WT flow controls tolerated while sending (WFTmax).
    pub max_wait_frames: u8,
    /// Frame buffers owned by the conversation.
    pub pool_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            mode: FrameMode::Classic,
            padding: None,
            bus_guard: None,
            timing: TimingParameters::default(),
            rx: RxPolicy::default(),
            max_wait_frames: DEFAULT_MAX_WAIT_FRAMES,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl Options {
    /// Builder entry point.
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder {
            options: Options::default(),
        }
    }

    /// Check every field against protocol limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.rx.max_datagram_len;
        if max == 0 || max > self.mode.max_datagram() {
            return Err(ConfigError::InvalidMaxDatagram { len: max });
        }
        if encode_st_min(self.rx.st_min).is_none() {
            return Err(ConfigError::UnencodableStMin {
                micros: self.rx.st_min.as_micros(),
            });
        }
        let t = &self.timing;
        let zero = Duration::from_micros(0);
        if [t.n_as, t.n_ar, t.n_bs, t.n_br, t.n_cs, t.n_cr]
            .iter()
            .any(|value| *value == zero)
        {
            return Err(ConfigError::ZeroTiming);
        }
        if self.pool_capacity < 2 {
            return Err(ConfigError::PoolTooSmall {
                capacity: self.pool_capacity,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
/// Fluent builder for [`Options`].
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    /// Classic CAN frames (default).
    pub fn classic(mut self) -> Self {
        self.options.mode = FrameMode::Classic;
        self
    }

    /// CAN FD frames. Raises the default receive cap to 65535 bytes.
    pub fn fd(mut self) -> Self {
        self.options.mode = FrameMode::Fd;
        if self.options.rx.max_datagram_len == MAX_CLASSIC_DATAGRAM {
            self.options.rx.max_datagram_len = u16::MAX as usize;
        }
        self
    }

    /// Pad every frame with `byte`.
    pub fn with_padding(mut self, byte: u8) -> Self {
        self.options.padding = Some(byte);
        self
    }

    /// Minimum gap between two data frames on the bus.
    pub fn with_bus_guard(mut self, gap: Duration) -> Self {
        self.options.bus_guard = Some(gap);
        self
    }

    /// Replace all six timing parameters.
    pub fn with_timing(mut self, timing: TimingParameters) -> Self {
        self.options.timing = timing;
        self
    }

    /// Override one timing parameter.
    pub fn with_timeout(mut self, kind: TimeoutKind, value: Duration) -> Self {
        self.options.timing.set(kind, value);
        self
    }

    /// Block size handed to the peer.
    pub fn with_block_size(mut self, block_size: u8) -> Self {
        self.options.rx.block_size = block_size;
        self
    }

    /// STmin handed to the peer.
    pub fn with_st_min(mut self, st_min: Duration) -> Self {
        self.options.rx.st_min = st_min;
        self
    }

    /// Send `count` WT flow controls before each CTS.
    pub fn with_wait_frames(mut self, count: u8) -> Self {
        self.options.rx.allow_wait = count > 0;
        self.options.rx.wait_frames = count;
        self
    }

    /// Largest datagram accepted on receive.
    pub fn with_max_datagram(mut self, len: usize) -> Self {
        self.options.rx.max_datagram_len = len;
        self
    }

    /// Consecutive WT frames tolerated on send.
    pub fn with_max_wait_frames(mut self, count: u8) -> Self {
        self.options.max_wait_frames = count;
        self
    }

    /// Frame buffers owned by the conversation.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.options.pool_capacity = capacity;
        self
    }

    /// Validate and return the options.
    pub fn build(self) -> Result<Options, ConfigError> {
        self.options.validate()?;
        Ok(self.options)
    }
}
