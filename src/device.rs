//! USB devices

use crate::descriptor::{Configuration, DeviceDescriptor};
use crate::hub::HubId;

/// Handle to a device in the device table
///
/// A `DeviceId` is a non-owning reference. It stays valid until the device
/// is freed; afterwards, the slot (and so the ID) may be handed to another
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) u8);

impl DeviceId {
    /// Index of this device's slot in the device table
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// The bus address assigned to this device during enumeration
    ///
    /// Addresses follow slot allocation: slot `n` uses address `n + 1`,
    /// so no two live devices share an address.
    pub fn address(self) -> u8 {
        self.0 + 1
    }
}

/// USB low / full / high speed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Speed {
    /// 1.5 Mbit/s
    Low,
    /// 12 Mbit/s
    #[default]
    Full,
    /// 480 Mbit/s
    High,
}

/// A device attached to the bus
#[derive(Debug)]
pub struct Device {
    parent: Option<DeviceId>,
    address: u8,
    speed: Speed,
    descriptor: DeviceDescriptor,
    configuration: Option<Configuration>,
    hub: Option<HubId>,
}

impl Device {
    pub(crate) const fn new(parent: Option<DeviceId>) -> Self {
        Device {
            parent,
            address: 0,
            speed: Speed::Full,
            descriptor: DeviceDescriptor::new(),
            configuration: None,
            hub: None,
        }
    }

    /// The hub this device is attached to, or `None` for the root
    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// The current bus address
    ///
    /// Zero until the device accepts its SET_ADDRESS request.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub(crate) fn set_address(&mut self, address: u8) {
        self.address = address;
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    pub(crate) fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub(crate) fn descriptor_mut(&mut self) -> &mut DeviceDescriptor {
        &mut self.descriptor
    }

    /// The active configuration, once read during enumeration
    pub fn configuration(&self) -> Option<&Configuration> {
        self.configuration.as_ref()
    }

    pub(crate) fn set_configuration(
        &mut self,
        configuration: Configuration,
    ) -> Option<Configuration> {
        self.configuration.replace(configuration)
    }

    /// The hub extension, if a hub driver is bound to this device
    pub fn hub(&self) -> Option<HubId> {
        self.hub
    }

    pub(crate) fn set_hub(&mut self, hub: Option<HubId>) {
        self.hub = hub;
    }

    /// Maximum packet size of the default control pipe
    ///
    /// Until the device descriptor is read, this is zero; transfers use
    /// the eight byte minimum in that case.
    pub fn max_packet_size0(&self) -> u16 {
        u16::from(self.descriptor.max_packet_size0())
    }
}
