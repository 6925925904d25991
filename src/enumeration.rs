//! Device enumeration
//!
//! A freshly reset device answers at the default address, with an
//! unknown control pipe size. Enumeration reads enough of the device
//! descriptor to learn that size, moves the device to its own address,
//! then reads and activates its first configuration.

use crate::descriptor::{Configuration, ConfigurationDescriptor, DeviceDescriptor};
use crate::device::DeviceId;
use crate::setup::SetupPacket;
use crate::{Error, Host, HostController, Kernel, Result, DEFAULT_MAX_PACKET_SIZE};
use usb_device::{
    control::{Recipient, Request, RequestType},
    descriptor::descriptor_type,
    UsbDirection,
};

/// Time the device may take to switch to its new address
const SET_ADDRESS_RECOVERY_MS: u32 = 2;

/// The configuration selected during enumeration
const CONFIGURATION_INDEX: u8 = 0;

fn get_descriptor(descriptor_type: u8, index: u8) -> SetupPacket {
    SetupPacket::new(
        UsbDirection::In,
        RequestType::Standard,
        Recipient::Device,
        Request::GET_DESCRIPTOR,
        u16::from(descriptor_type) << 8 | u16::from(index),
        0,
    )
}

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Read up to `length` bytes of the device descriptor into the device
    fn read_device_descriptor(&self, device: DeviceId, length: usize) -> Result<()> {
        let mut buffer = [0u8; DeviceDescriptor::LENGTH];
        let length = length.min(DeviceDescriptor::LENGTH);
        let read = self.control_transfer(
            Some(device),
            get_descriptor(descriptor_type::DEVICE, 0),
            &mut buffer[..length],
        )?;
        self.with_device_mut(device, |dev| dev.descriptor_mut().update(&buffer[..read]))
            .ok_or(Error::Failed)
    }

    fn set_address(&self, device: DeviceId) -> Result<()> {
        let address = device.address();
        self.control_transfer(
            Some(device),
            SetupPacket::new(
                UsbDirection::Out,
                RequestType::Standard,
                Recipient::Device,
                Request::SET_ADDRESS,
                u16::from(address),
                0,
            ),
            &mut [],
        )?;
        self.with_device_mut(device, |dev| dev.set_address(address))
            .ok_or(Error::Failed)?;
        self.kernel.delay_ms(SET_ADDRESS_RECOVERY_MS);
        Ok(())
    }

    /// Read the configuration block, and record it on the device
    fn read_configuration(&self, device: DeviceId, index: u8) -> Result<()> {
        let mut header = [0u8; ConfigurationDescriptor::LENGTH];
        if let Err(err) = self.control_transfer(
            Some(device),
            get_descriptor(descriptor_type::CONFIGURATION, index),
            &mut header,
        ) {
            warn!("Error when reading configuration descriptor header");
            return Err(err);
        }

        let total_length = ConfigurationDescriptor::new(&header)
            .ok_or(Error::InvalidDescriptor)?
            .total_length();
        if usize::from(total_length) < ConfigurationDescriptor::LENGTH {
            warn!("Configuration wTotalLength {} is too short", total_length);
            return Err(Error::InvalidDescriptor);
        }

        let mut block = self.allocate_buffer(usize::from(total_length)).map_err(|err| {
            warn!("Error when allocating memory for configuration descriptor");
            err
        })?;
        if let Err(err) = self.control_transfer(
            Some(device),
            get_descriptor(descriptor_type::CONFIGURATION, index),
            &mut block,
        ) {
            warn!("Error when getting whole configuration descriptor");
            self.release(block);
            return Err(err);
        }

        // A rejected block is freed here, so parse with interrupts masked.
        let configuration = self.free(|_| Configuration::parse(block))?;
        self.with_device_mut(device, move |dev| dev.set_configuration(configuration))
            .ok_or(Error::Failed)
            .map(|previous| self.release(previous))
    }

    fn set_configuration(&self, device: DeviceId, value: u8) -> Result<()> {
        self.control_transfer(
            Some(device),
            SetupPacket::new(
                UsbDirection::Out,
                RequestType::Standard,
                Recipient::Device,
                Request::SET_CONFIGURATION,
                u16::from(value),
                0,
            ),
            &mut [],
        )
        .map(|_| ())
    }

    /// Enumerate a device that's answering at the default address
    ///
    /// On success, the device has its own address, its device descriptor,
    /// and an active, parsed configuration. On failure, the device is left
    /// partially populated; the caller frees it.
    pub fn attach_device(&self, device: DeviceId) -> Result<()> {
        let address = device.address();

        // Enough to learn the control pipe's packet size
        self.with_device_mut(device, |dev| {
            dev.descriptor_mut()
                .set_max_packet_size0(DEFAULT_MAX_PACKET_SIZE as u8)
        })
        .ok_or(Error::Failed)?;
        let header = usize::from(DEFAULT_MAX_PACKET_SIZE);
        if let Err(err) = self.read_device_descriptor(device, header) {
            warn!("Error when reading device descriptor header");
            return Err(err);
        }

        if let Err(err) = self.set_address(device) {
            warn!("Error when setting address {}", address);
            return Err(err);
        }

        let max_packet_size0 = self.with_device(device, |dev| dev.max_packet_size0());
        if max_packet_size0.is_some_and(|size| size > DEFAULT_MAX_PACKET_SIZE) {
            if let Err(err) = self.read_device_descriptor(device, DeviceDescriptor::LENGTH) {
                warn!("Error when reading complete device descriptor");
                return Err(err);
            }
        }

        if let Err(err) = self.read_configuration(device, CONFIGURATION_INDEX) {
            warn!("Error when reading configuration of device {}", address);
            return Err(err);
        }

        let value = self
            .with_device(device, |dev| {
                dev.configuration()
                    .map(|config| config.descriptor().configuration_value())
            })
            .flatten()
            .ok_or(Error::Failed)?;
        if let Err(err) = self.set_configuration(device, value) {
            warn!("Error when setting configuration {}", value);
            return Err(err);
        }

        info!("Device {} attached", address);
        Ok(())
    }

    /// Enumerate a device, then bind the hub driver if it's a hub
    ///
    /// Devices that aren't hubs stay enumerated and configured, for class
    /// drivers to claim.
    pub fn enumerate(&'static self, device: DeviceId) -> Result<()> {
        self.attach_device(device)?;
        match self.hub_probe(device) {
            Ok(()) | Err(Error::NotSupported) => Ok(()),
            Err(err) => {
                warn!("Error when binding hub driver to device {}", device.address());
                Err(err)
            }
        }
    }
}
