//! Binding and unbinding hubs

use super::{
    status_bitmap_size, HubDescriptor, HubId, Port, PortFeature, HUB_CLASS, HUB_PROTOCOL_MAX,
};
use crate::descriptor::{TransferType, HEADER_LENGTH};
use crate::device::{Device, DeviceId};
use crate::request::{Callback, Endpoint, Request};
use crate::setup::SetupPacket;
use crate::{Error, Host, HostController, Kernel, Result};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use usb_device::{
    control::{self, Recipient, RequestType},
    UsbDirection,
};

/// Check that `device` looks like a hub we can drive, and find its
/// status change endpoint
fn status_change_endpoint(device: &Device) -> Result<Endpoint> {
    let descriptor = device.descriptor();
    if descriptor.device_class() != HUB_CLASS
        || descriptor.device_subclass() != 0
        || descriptor.device_protocol() > HUB_PROTOCOL_MAX
    {
        return Err(Error::NotSupported);
    }

    let configuration = device.configuration().ok_or(Error::NotSupported)?;
    if configuration.descriptor().num_interfaces() != 1 {
        warn!("Hub has more than one interface");
        return Err(Error::NotSupported);
    }
    let interface = configuration.interface(0).ok_or(Error::NotSupported)?;
    if interface.num_endpoints() != 1
        || interface.interface_class() != HUB_CLASS
        || interface.interface_subclass() != 0
        || interface.interface_protocol() > HUB_PROTOCOL_MAX
    {
        warn!("Hub interface isn't supported");
        return Err(Error::NotSupported);
    }

    let endpoint = configuration.endpoint(0, 0).ok_or(Error::NotSupported)?;
    if endpoint.address().direction() != UsbDirection::In
        || endpoint.transfer_type() != TransferType::Interrupt
    {
        warn!("Hub endpoint isn't interrupt IN");
        return Err(Error::NotSupported);
    }

    Ok(Endpoint {
        address: endpoint.address(),
        transfer_type: endpoint.transfer_type(),
        max_packet_size: endpoint.max_packet_size(),
        interval: endpoint.interval(),
    })
}

fn get_hub_descriptor() -> SetupPacket {
    SetupPacket::new(
        UsbDirection::In,
        RequestType::Class,
        Recipient::Device,
        control::Request::GET_DESCRIPTOR,
        u16::from(HubDescriptor::TYPE) << 8,
        0,
    )
}

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Bind the hub driver to an enumerated device
    ///
    /// Returns [`Error::NotSupported`] if the device isn't a hub we can
    /// drive. Otherwise, powers the hub's ports, and starts listening for
    /// status changes. The hub worker starts with the first hub.
    pub fn hub_probe(&'static self, device: DeviceId) -> Result<()> {
        let endpoint = self
            .with_device(device, status_change_endpoint)
            .ok_or(Error::Failed)??;

        self.hub_driver_init()?;

        let hub = self.hub_allocate(device)?;
        if let Err(err) = self.hub_bind(hub, device, endpoint) {
            warn!("Error when binding hub {}", device.address());
            self.hub_free(hub);
            return Err(err);
        }

        info!("USB hub driver bound to device {}", device.address());
        Ok(())
    }

    /// Unbind the hub driver from `device`
    ///
    /// Every device below the hub is released.
    pub fn hub_remove(&self, device: DeviceId) -> Result<()> {
        let hub = self
            .with_device(device, Device::hub)
            .flatten()
            .ok_or(Error::NotSupported)?;

        for port in 1..=self.hub_port_count(hub) {
            if let Some(child) = self.hub_port_child(hub, port) {
                self.hub_set_port_child(hub, port, None);
                self.release_tree(child);
            }
        }
        self.hub_free(hub);

        info!("USB hub driver removed from device {}", device.address());
        Ok(())
    }

    /// Allocate a hub extension, and link it to `device`
    fn hub_allocate(&self, device: DeviceId) -> Result<HubId> {
        self.free(|cs| {
            let mut devices = self.devices.borrow(cs).borrow_mut();
            let dev = devices.get_mut(device).ok_or(Error::Failed)?;
            if dev.hub().is_some() {
                warn!("Device {} already has a hub extension", device.address());
                return Err(Error::AlreadyBound);
            }
            let hub = self
                .hubs
                .borrow(cs)
                .borrow_mut()
                .allocate(device)
                .ok_or_else(|| {
                    warn!("Hub table exhausted");
                    Error::Exhausted
                })?;
            dev.set_hub(Some(hub));
            Ok(hub)
        })
    }

    /// Release a hub extension, and everything it owns
    ///
    /// Devices attached to the hub's ports are not touched. An in-flight
    /// status change request is freed when it completes.
    pub(crate) fn hub_free(&self, hub: HubId) {
        self.free(|cs| {
            let Some(extension) = self.hubs.borrow(cs).borrow_mut().free(hub) else {
                return;
            };
            if let Some(dev) = self.devices.borrow(cs).borrow_mut().get_mut(extension.device) {
                if dev.hub() == Some(hub) {
                    dev.set_hub(None);
                }
            }
            let pending = self.pending.borrow(cs);
            pending.set(pending.get() & !hub.bit());
            drop(extension);
        });
        debug!("FREE HUB {}", hub.index());
    }

    /// Read the hub descriptor, header first
    fn hub_read_descriptor(&self, device: DeviceId) -> Result<HubDescriptor> {
        let mut header = [0u8; HEADER_LENGTH];
        if let Err(err) = self.control_transfer(Some(device), get_hub_descriptor(), &mut header) {
            warn!("Error when reading hub descriptor header");
            return Err(err);
        }

        let length = usize::from(header[0]);
        if !(HubDescriptor::MIN_LENGTH..=HubDescriptor::MAX_LENGTH).contains(&length) {
            warn!("Invalid hub descriptor length {}", length);
            return Err(Error::InvalidDescriptor);
        }

        let mut buffer = self.allocate_buffer(length)?;
        if let Err(err) = self.control_transfer(Some(device), get_hub_descriptor(), &mut buffer) {
            warn!("Error when reading hub descriptor");
            self.release(buffer);
            return Err(err);
        }
        if buffer[1] != HubDescriptor::TYPE {
            warn!("Hub descriptor has type {:#x}", buffer[1]);
            self.release(buffer);
            return Err(Error::InvalidDescriptor);
        }
        HubDescriptor::new(buffer).ok_or(Error::InvalidDescriptor)
    }

    /// Set up an allocated extension, power the ports, and start listening
    fn hub_bind(&'static self, hub: HubId, device: DeviceId, endpoint: Endpoint) -> Result<()> {
        let descriptor = self.hub_read_descriptor(device)?;
        let num_ports = descriptor.num_ports();
        let power_good = u32::from(descriptor.power_on_to_power_good());
        if num_ports == 0 {
            warn!("Hub {} has no ports", device.address());
            self.release(descriptor);
            return Err(Error::InvalidDescriptor);
        }
        self.with_hub_mut(hub, |extension| extension.descriptor = Some(descriptor))
            .ok_or(Error::Failed)?;

        let size = status_bitmap_size(num_ports);
        let changed = self.allocate_buffer(size)?;
        self.with_hub_mut(hub, |extension| extension.changed = changed)
            .ok_or(Error::Failed)?;

        let ports = self.free(|_| {
            let mut ports = Vec::new();
            ports.try_reserve_exact(usize::from(num_ports) + 1).ok()?;
            ports.resize(usize::from(num_ports) + 1, Port::new());
            Some(ports)
        });
        let ports = ports.ok_or(Error::Exhausted)?;
        self.with_hub_mut(hub, |extension| extension.ports = ports)
            .ok_or(Error::Failed)?;

        let mut request = self.allocate_request(size).ok_or_else(|| {
            warn!("Error allocating hub status change request");
            Error::Exhausted
        })?;
        let (address, speed, max_packet_size) = self
            .with_device(device, |dev| (dev.address(), dev.speed(), dev.max_packet_size0()))
            .ok_or(Error::Failed)?;
        let token = self.with_hub(hub, |extension| extension.token).ok_or(Error::Failed)?;
        request.set_target(Some(device), address, speed, max_packet_size);
        request.set_endpoint(Some(endpoint));
        let callback = self.free(|_| -> Callback {
            Arc::new(move |request: Box<Request>| {
                self.hub_status_changed(hub, token, request)
            })
        });
        self.with_hub_mut(hub, |extension| {
            extension.status_request = Some(request);
            extension.status_callback = Some(callback);
        })
        .ok_or(Error::Failed)?;

        for port in 1..=num_ports {
            if self.hub_port_feature(device, port, PortFeature::Power, true).is_err() {
                warn!("Error when powering hub {} port {}", device.address(), port);
            }
        }
        self.kernel.delay_ms(2 * power_good);

        self.hub_resubmit(hub);
        Ok(())
    }
}
