//! Hub class descriptor, port status, and port features

use alloc::vec::Vec;

/// The hub descriptor
///
/// Owns the descriptor as read from the hub. The variable-length tail
/// (removable and power control masks) is kept, but not decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubDescriptor(Vec<u8>);

impl HubDescriptor {
    /// `bDescriptorType` of a hub descriptor
    pub const TYPE: u8 = 0x29;
    /// Shortest valid descriptor: one port
    pub const MIN_LENGTH: usize = 9;
    /// Longest valid descriptor: 255 ports
    pub const MAX_LENGTH: usize = 71;
    /// Fields before the variable-length tail
    const FIXED_LENGTH: usize = 7;

    /// Returns `None` if `bytes` can't hold the fixed fields, or isn't
    /// a hub descriptor.
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        (bytes.len() >= Self::FIXED_LENGTH && bytes[1] == Self::TYPE)
            .then_some(HubDescriptor(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn num_ports(&self) -> u8 {
        self.0[2]
    }

    pub fn characteristics(&self) -> u16 {
        u16::from_le_bytes([self.0[3], self.0[4]])
    }

    /// Time from port power-on until power is good, in units of 2ms
    pub fn power_on_to_power_good(&self) -> u8 {
        self.0[5]
    }

    /// Maximum current of the hub controller, in mA
    pub fn controller_current(&self) -> u8 {
        self.0[6]
    }
}

/// Bytes needed for a change bitmap covering the hub and `ports` ports
pub const fn status_bitmap_size(ports: u8) -> usize {
    ports as usize / 8 + 1
}

bitflags::bitflags! {
    /// `wPortStatus`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortStatus: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
    }
}

bitflags::bitflags! {
    /// `wPortChange`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortChange: u16 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
    }
}

/// Port feature selectors, for SET_FEATURE and CLEAR_FEATURE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PortFeature {
    Connection = 0,
    Enable = 1,
    Suspend = 2,
    OverCurrent = 3,
    Reset = 4,
    Power = 8,
    LowSpeed = 9,
    CConnection = 16,
    CEnable = 17,
    CSuspend = 18,
    COverCurrent = 19,
    CReset = 20,
    Test = 21,
    Indicator = 22,
}
