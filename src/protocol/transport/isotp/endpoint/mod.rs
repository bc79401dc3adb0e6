//! Addressing of one ISO-TP conversation: identifiers plus the optional
//! address byte carried in front of the PCI.
use crate::error::{CanIdBuildError, ConfigError};
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::can_id::CanId;

/// How target/source addresses are encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AddressingMode {
    /// Addresses implied by the identifiers.
    Normal,
    /// Addresses encoded in a 29-bit identifier (`0x18DA_TA_SA`).
    NormalFixed,
    /// Target address carried in the first payload byte.
    Extended,
    /// Address extension carried in the first payload byte.
    Mixed,
}

impl AddressingMode {
    /// Whether the first payload byte is an address byte.
    pub const fn has_extension_byte(&self) -> bool {
        matches!(self, AddressingMode::Extended | AddressingMode::Mixed)
    }
}

/// Immutable identity of one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Endpoint {
    /// Identifier used for frames we send.
    pub tx_id: CanId,
    /// Identifier of frames addressed to us.
    pub rx_id: CanId,
    pub addressing: AddressingMode,
    /// Written as the first payload byte on transmit (Extended/Mixed).
    pub target_address: Option<u8>,
    /// Expected as the first payload byte on receive (Extended/Mixed).
    pub source_address: Option<u8>,
}

impl Endpoint {
    /// Normal addressing: identifiers only.
    pub fn normal(tx_id: CanId, rx_id: CanId) -> Self {
        Self {
            tx_id,
            rx_id,
            addressing: AddressingMode::Normal,
            target_address: None,
            source_address: None,
        }
    }

    /// Normal-fixed addressing between our address `source` and the peer `target`.
    pub fn normal_fixed(target: u8, source: u8) -> Result<Self, CanIdBuildError> {
        Ok(Self {
            tx_id: CanId::builder(target, source).build()?,
            rx_id: CanId::builder(source, target).build()?,
            addressing: AddressingMode::NormalFixed,
            target_address: Some(target),
            source_address: Some(source),
        })
    }

    /// Extended addressing: `target` prefixes our frames, `source` prefixes the peer's.
    pub fn extended(tx_id: CanId, rx_id: CanId, target: u8, source: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            addressing: AddressingMode::Extended,
            target_address: Some(target),
            source_address: Some(source),
        }
    }

    /// Mixed addressing: the same address extension prefixes both directions.
    pub fn mixed(tx_id: CanId, rx_id: CanId, address_extension: u8) -> Self {
        Self {
            tx_id,
            rx_id,
            addressing: AddressingMode::Mixed,
            target_address: Some(address_extension),
            source_address: Some(address_extension),
        }
    }

    /// Number of payload bytes taken by the address byte (0 or 1).
    pub const fn extension_len(&self) -> usize {
        if self.addressing.has_extension_byte() {
            1
        } else {
            0
        }
    }

    /// Address byte written in front of outgoing PCI.
    pub fn tx_extension(&self) -> Option<u8> {
        self.addressing
            .has_extension_byte()
            .then_some(self.target_address)
            .flatten()
    }

    /// Address byte expected in front of incoming PCI.
    pub fn rx_extension(&self) -> Option<u8> {
        self.addressing
            .has_extension_byte()
            .then_some(self.source_address)
            .flatten()
    }

    /// Whether an incoming frame belongs to this endpoint.
    pub fn accepts(&self, frame: &CanFrame) -> bool {
        if frame.id != self.rx_id {
            return false;
        }
        match self.rx_extension() {
            Some(expected) => frame.len > 0 && frame.data[0] == expected,
            None => true,
        }
    }

    /// Whether one of our own transmitted frames (TX echo) belongs to this endpoint.
    pub fn owns_transmitted(&self, frame: &CanFrame) -> bool {
        if frame.id != self.tx_id {
            return false;
        }
        match self.tx_extension() {
            Some(expected) => frame.len > 0 && frame.data[0] == expected,
            None => true,
        }
    }

    /// Two endpoints conflict when the router could not tell their inbound traffic apart.
    pub fn conflicts_with(&self, other: &Endpoint) -> bool {
        self.rx_id == other.rx_id && self.rx_extension() == other.rx_extension()
    }

    /// Reject inconsistent endpoints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tx_id == self.rx_id && self.tx_extension() == self.rx_extension() {
            return Err(ConfigError::MirroredIds);
        }
        if self.addressing.has_extension_byte()
            && (self.target_address.is_none() || self.source_address.is_none())
        {
            return Err(ConfigError::MissingAddress);
        }
        Ok(())
    }
}
