//! CAN identifiers used by ISO-TP endpoints: 11-bit and 29-bit values, plus the
//! 29-bit layouts that carry target/source addresses for the normal-fixed and
//! mixed addressing formats (ISO 15765-2, derived from SAE J1939).
use embedded_can::{ExtendedId, Id, StandardId};

use crate::error::CanIdBuildError;

/// Largest 11-bit identifier.
pub const STANDARD_ID_MAX: u32 = 0x7FF;
/// Largest 29-bit identifier.
pub const EXTENDED_ID_MAX: u32 = 0x1FFF_FFFF;

/// PDU format byte of a physically addressed normal-fixed frame.
pub const PF_NORMAL_FIXED_PHYSICAL: u8 = 0xDA;
/// PDU format byte of a functionally addressed normal-fixed frame.
pub const PF_NORMAL_FIXED_FUNCTIONAL: u8 = 0xDB;
/// PDU format byte of a physically addressed 29-bit mixed frame.
pub const PF_MIXED_PHYSICAL: u8 = 0xCE;
/// PDU format byte of a functionally addressed 29-bit mixed frame.
pub const PF_MIXED_FUNCTIONAL: u8 = 0xCD;

//==================================================================================CAN_ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
/// A CAN identifier together with its frame format (11 or 29 bits).
pub struct CanId {
    raw: u32,
    extended: bool,
}

impl CanId {
    /// 11-bit identifier. Returns `None` above `0x7FF`.
    pub const fn standard(raw: u16) -> Option<Self> {
        if raw as u32 > STANDARD_ID_MAX {
            return None;
        }
        Some(Self {
            raw: raw as u32,
            extended: false,
        })
    }

    /// 29-bit identifier. Returns `None` above `0x1FFF_FFFF`.
    pub const fn extended(raw: u32) -> Option<Self> {
        if raw > EXTENDED_ID_MAX {
            return None;
        }
        Some(Self {
            raw,
            extended: true,
        })
    }

    /// Creates a pre-configured builder for a 29-bit addressed identifier.
    pub fn builder(target_address: u8, source_address: u8) -> CanIdBuilder {
        CanIdBuilder::new(target_address, source_address)
    }

    /// Numeric value without the format flag.
    pub const fn raw(&self) -> u32 {
        self.raw
    }

    /// `true` for 29-bit identifiers.
    pub const fn is_extended(&self) -> bool {
        self.extended
    }

    // Getters used to deconstruct 29-bit addressed identifiers
    /// Returns the priority (3 bits, value 0-7). Always 0 for 11-bit IDs.
    pub fn priority(&self) -> u8 {
        if !self.extended {
            return 0;
        }
        ((self.raw >> 26) & 0x07) as u8
    }

    /// PDU format byte (bits 16..24) of a 29-bit identifier.
    pub fn pdu_format(&self) -> Option<u8> {
        self.extended.then(|| ((self.raw >> 16) & 0xFF) as u8)
    }

    /// Target address (N_TA, PS byte) of a 29-bit identifier.
    pub fn target_address(&self) -> Option<u8> {
        self.extended.then(|| ((self.raw >> 8) & 0xFF) as u8)
    }

    /// Source address (N_SA, low byte) of a 29-bit identifier.
    pub fn source_address(&self) -> Option<u8> {
        self.extended.then(|| (self.raw & 0xFF) as u8)
    }
}

impl From<StandardId> for CanId {
    fn from(id: StandardId) -> Self {
        Self {
            raw: id.as_raw() as u32,
            extended: false,
        }
    }
}

impl From<ExtendedId> for CanId {
    fn from(id: ExtendedId) -> Self {
        Self {
            raw: id.as_raw(),
            extended: true,
        }
    }
}

impl From<Id> for CanId {
    fn from(id: Id) -> Self {
        match id {
            Id::Standard(id) => id.into(),
            Id::Extended(id) => id.into(),
        }
    }
}

impl From<CanId> for Id {
    fn from(id: CanId) -> Self {
        // Both constructors were range-checked when the `CanId` was built.
        if id.extended {
            match ExtendedId::new(id.raw) {
                Some(ext) => Id::Extended(ext),
                None => Id::Extended(ExtendedId::MAX),
            }
        } else {
            match StandardId::new(id.raw as u16) {
                Some(std) => Id::Standard(std),
                None => Id::Standard(StandardId::MAX),
            }
        }
    }
}

//==================================================================================CAN_ID_BUILDER
/// 29-bit identifier layout carrying the ISO-TP addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FixedLayout {
    /// Normal-fixed addressing (PF 0xDA / 0xDB).
    NormalFixed,
    /// 29-bit mixed addressing (PF 0xCE / 0xCD); the address extension rides in the payload.
    Mixed,
}

/// Physical (1:1) or functional (1:n) target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TargetType {
    Physical,
    Functional,
}

#[derive(Debug)]
/// Fluent builder for addressed 29-bit identifiers.
pub struct CanIdBuilder {
    pub priority: u8,
    pub target_address: u8,
    pub source_address: u8,
    pub layout: FixedLayout,
    pub target_type: TargetType,
}

impl CanIdBuilder {
    /// Initializes the builder for a physical normal-fixed identifier.
    pub fn new(target_address: u8, source_address: u8) -> Self {
        Self {
            priority: 6, // Default diagnostic priority
            target_address,
            source_address,
            layout: FixedLayout::NormalFixed,
            target_type: TargetType::Physical,
        }
    }

    /// Sets the priority (3 bits) to use during construction.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority & 0x07;
        self
    }

    /// Selects the 29-bit mixed layout.
    pub fn mixed(mut self) -> Self {
        self.layout = FixedLayout::Mixed;
        self
    }

    /// Addresses a functional group instead of a single node.
    pub fn functional(mut self) -> Self {
        self.target_type = TargetType::Functional;
        self
    }

    /// Builds the identifier: `priority | R=0 | DP=0 | PF | TA | SA`.
    ///
    /// Target and source must differ for physical addressing.
    pub fn build(self) -> Result<CanId, CanIdBuildError> {
        if self.target_type == TargetType::Physical && self.target_address == self.source_address
        {
            return Err(CanIdBuildError::SameTargetAndSource {
                address: self.source_address,
            });
        }

        let pf = match (self.layout, self.target_type) {
            (FixedLayout::NormalFixed, TargetType::Physical) => PF_NORMAL_FIXED_PHYSICAL,
            (FixedLayout::NormalFixed, TargetType::Functional) => PF_NORMAL_FIXED_FUNCTIONAL,
            (FixedLayout::Mixed, TargetType::Physical) => PF_MIXED_PHYSICAL,
            (FixedLayout::Mixed, TargetType::Functional) => PF_MIXED_FUNCTIONAL,
        };

        let raw = ((self.priority as u32) << 26)
            | ((pf as u32) << 16)
            | ((self.target_address as u32) << 8)
            | (self.source_address as u32);

        CanId::extended(raw).ok_or(CanIdBuildError::OutOfRange { raw })
    }
}
