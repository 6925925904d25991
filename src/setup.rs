//! Control transfer setup packets

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

/// A standard, eight byte setup packet
///
/// `length` is the size of the data stage. The control transfer
/// routines set it from the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub direction: UsbDirection,
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Size of a setup packet on the wire
    pub const SIZE: usize = 8;

    /// Create a setup packet without a data stage
    pub const fn new(
        direction: UsbDirection,
        request_type: RequestType,
        recipient: Recipient,
        request: u8,
        value: u16,
        index: u16,
    ) -> Self {
        SetupPacket {
            direction,
            request_type,
            recipient,
            request,
            value,
            index,
            length: 0,
        }
    }

    /// The packed `bmRequestType` field
    pub fn request_type_bits(&self) -> u8 {
        (self.direction as u8 & 0x80)
            | ((self.request_type as u8 & 0b11) << 5)
            | (self.recipient as u8 & 0b1_1111)
    }

    /// Serialize the packet in bus (little endian) order
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type_bits(),
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }
}
