//! Standard descriptors
//!
//! Descriptors are kept in their wire representation. The types in this
//! module are thin views that decode fields on access.
//!
//! A [`Configuration`] owns the complete configuration descriptor block
//! (configuration, interface, endpoint, and class descriptors) returned
//! by the device. Parsing records where the primary interfaces and their
//! endpoints live inside that block.

use crate::{Error, Result, MAX_ENDPOINTS, MAX_INTERFACES};
use alloc::vec::Vec;
use usb_device::{descriptor::descriptor_type, endpoint::EndpointAddress};

/// Every descriptor starts with `bLength` and `bDescriptorType`
pub const HEADER_LENGTH: usize = 2;

fn le16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

/// The standard device descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor([u8; DeviceDescriptor::LENGTH]);

impl DeviceDescriptor {
    pub const LENGTH: usize = 18;

    /// An all-zero descriptor
    pub const fn new() -> Self {
        DeviceDescriptor([0; Self::LENGTH])
    }

    /// Overwrite the leading bytes of the descriptor with `bytes`
    ///
    /// Used when only part of the descriptor was read. Bytes beyond
    /// the descriptor's length are ignored.
    pub fn update(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(Self::LENGTH);
        self.0[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn usb_release(&self) -> u16 {
        le16(&self.0, 2)
    }

    pub fn device_class(&self) -> u8 {
        self.0[4]
    }

    pub fn device_subclass(&self) -> u8 {
        self.0[5]
    }

    pub fn device_protocol(&self) -> u8 {
        self.0[6]
    }

    /// Maximum packet size of the default control pipe
    pub fn max_packet_size0(&self) -> u8 {
        self.0[7]
    }

    pub fn set_max_packet_size0(&mut self, size: u8) {
        self.0[7] = size;
    }

    pub fn vendor_id(&self) -> u16 {
        le16(&self.0, 8)
    }

    pub fn product_id(&self) -> u16 {
        le16(&self.0, 10)
    }

    pub fn device_release(&self) -> u16 {
        le16(&self.0, 12)
    }

    pub fn num_configurations(&self) -> u8 {
        self.0[17]
    }
}

impl Default for DeviceDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// View of a configuration descriptor header
#[derive(Debug, Clone, Copy)]
pub struct ConfigurationDescriptor<'a>(&'a [u8]);

impl<'a> ConfigurationDescriptor<'a> {
    pub const LENGTH: usize = 9;

    /// Returns `None` if `bytes` is too short to hold the header.
    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() >= Self::LENGTH).then_some(ConfigurationDescriptor(bytes))
    }

    /// Size of the complete configuration block
    pub fn total_length(&self) -> u16 {
        le16(self.0, 2)
    }

    pub fn num_interfaces(&self) -> u8 {
        self.0[4]
    }

    pub fn configuration_value(&self) -> u8 {
        self.0[5]
    }

    pub fn attributes(&self) -> u8 {
        self.0[7]
    }

    /// Maximum bus power, in units of 2mA
    pub fn max_power(&self) -> u8 {
        self.0[8]
    }
}

/// View of an interface descriptor
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor<'a>(&'a [u8]);

impl<'a> InterfaceDescriptor<'a> {
    pub const LENGTH: usize = 9;

    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() >= Self::LENGTH).then_some(InterfaceDescriptor(bytes))
    }

    pub fn interface_number(&self) -> u8 {
        self.0[2]
    }

    pub fn alternate_setting(&self) -> u8 {
        self.0[3]
    }

    pub fn num_endpoints(&self) -> u8 {
        self.0[4]
    }

    pub fn interface_class(&self) -> u8 {
        self.0[5]
    }

    pub fn interface_subclass(&self) -> u8 {
        self.0[6]
    }

    pub fn interface_protocol(&self) -> u8 {
        self.0[7]
    }
}

/// Endpoint transfer type, from `bmAttributes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// View of an endpoint descriptor
#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor<'a>(&'a [u8]);

impl<'a> EndpointDescriptor<'a> {
    pub const LENGTH: usize = 7;

    pub fn new(bytes: &'a [u8]) -> Option<Self> {
        (bytes.len() >= Self::LENGTH).then_some(EndpointDescriptor(bytes))
    }

    pub fn address(&self) -> EndpointAddress {
        EndpointAddress::from(self.0[2])
    }

    pub fn transfer_type(&self) -> TransferType {
        match self.0[3] & 0b11 {
            0 => TransferType::Control,
            1 => TransferType::Isochronous,
            2 => TransferType::Bulk,
            _ => TransferType::Interrupt,
        }
    }

    pub fn max_packet_size(&self) -> u16 {
        le16(self.0, 4) & 0x7FF
    }

    pub fn interval(&self) -> u8 {
        self.0[6]
    }
}

/// A parsed configuration descriptor block
///
/// Alternate interface settings are not supported; they're skipped,
/// along with their endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    block: Vec<u8>,
    interfaces: [Option<usize>; MAX_INTERFACES],
    endpoints: [[Option<usize>; MAX_ENDPOINTS]; MAX_INTERFACES],
}

impl Configuration {
    /// Parse a complete configuration block
    ///
    /// The walk never reads beyond `block`. A header with a `bLength`
    /// below the header size, a descriptor running past the end of the
    /// block, more interfaces or endpoints than declared (or than we can
    /// hold), and endpoints that precede any interface are all errors.
    pub fn parse(block: Vec<u8>) -> Result<Self> {
        let config = ConfigurationDescriptor::new(&block).ok_or_else(|| {
            warn!("Configuration descriptor shorter than its header");
            Error::InvalidDescriptor
        })?;
        let num_interfaces = usize::from(config.num_interfaces());

        let mut interfaces = [None; MAX_INTERFACES];
        let mut endpoints = [[None; MAX_ENDPOINTS]; MAX_INTERFACES];

        // (slot, declared endpoints, recorded endpoints) of the current interface
        let mut current: Option<(usize, usize, usize)> = None;
        let mut alternate = false;

        let mut offset = 0;
        while offset < block.len() {
            let header = block
                .get(offset..offset + HEADER_LENGTH)
                .ok_or_else(|| {
                    warn!("Truncated descriptor header at offset {}", offset);
                    Error::InvalidDescriptor
                })?;
            let length = usize::from(header[0]);
            if length < HEADER_LENGTH {
                warn!("Invalid bLength in configuration descriptor header");
                return Err(Error::InvalidDescriptor);
            }
            let descriptor = block.get(offset..offset + length).ok_or_else(|| {
                warn!("Descriptor at offset {} runs past the configuration", offset);
                Error::InvalidDescriptor
            })?;

            match header[1] {
                descriptor_type::INTERFACE => {
                    let interface =
                        InterfaceDescriptor::new(descriptor).ok_or(Error::InvalidDescriptor)?;
                    if interface.alternate_setting() != 0 {
                        debug!("Skipping alternate setting interface");
                        alternate = true;
                    } else {
                        alternate = false;
                        let slot = current.map_or(0, |(slot, _, _)| slot + 1);
                        if slot >= MAX_INTERFACES {
                            warn!("Too many interfaces");
                            return Err(Error::InvalidDescriptor);
                        }
                        if slot >= num_interfaces {
                            warn!("bNumInterfaces mismatch");
                            return Err(Error::InvalidDescriptor);
                        }
                        interfaces[slot] = Some(offset);
                        current = Some((slot, usize::from(interface.num_endpoints()), 0));
                    }
                }
                descriptor_type::ENDPOINT => {
                    let Some((slot, declared, recorded)) = current.as_mut() else {
                        warn!("Endpoint belonging to no interface");
                        return Err(Error::InvalidDescriptor);
                    };
                    if alternate {
                        debug!("Skipping endpoint of alternate setting interface");
                    } else {
                        EndpointDescriptor::new(descriptor).ok_or(Error::InvalidDescriptor)?;
                        if *recorded >= MAX_ENDPOINTS {
                            warn!("Too many endpoints");
                            return Err(Error::InvalidDescriptor);
                        }
                        if *recorded >= *declared {
                            warn!("bNumEndpoints mismatch");
                            return Err(Error::InvalidDescriptor);
                        }
                        endpoints[*slot][*recorded] = Some(offset);
                        *recorded += 1;
                    }
                }
                _ => {}
            }

            offset += length;
        }

        Ok(Configuration {
            block,
            interfaces,
            endpoints,
        })
    }

    /// The configuration descriptor header
    pub fn descriptor(&self) -> ConfigurationDescriptor<'_> {
        // Checked in parse().
        ConfigurationDescriptor(&self.block)
    }

    /// The complete configuration block, as read from the device
    pub fn as_bytes(&self) -> &[u8] {
        &self.block
    }

    /// The primary setting of the interface recorded in `slot`
    pub fn interface(&self, slot: usize) -> Option<InterfaceDescriptor<'_>> {
        let offset = (*self.interfaces.get(slot)?)?;
        Some(InterfaceDescriptor(&self.block[offset..]))
    }

    /// Number of recorded interfaces
    pub fn interface_count(&self) -> usize {
        self.interfaces.iter().take_while(|slot| slot.is_some()).count()
    }

    /// The endpoint recorded in `slot` of the interface in `interface`
    pub fn endpoint(&self, interface: usize, slot: usize) -> Option<EndpointDescriptor<'_>> {
        let offset = (*self.endpoints.get(interface)?.get(slot)?)?;
        Some(EndpointDescriptor(&self.block[offset..]))
    }

    /// Offsets of the recorded interfaces within the block
    pub fn interface_offsets(&self) -> &[Option<usize>; MAX_INTERFACES] {
        &self.interfaces
    }

    /// Offsets of the recorded endpoints within the block
    pub fn endpoint_offsets(&self) -> &[[Option<usize>; MAX_ENDPOINTS]; MAX_INTERFACES] {
        &self.endpoints
    }
}
