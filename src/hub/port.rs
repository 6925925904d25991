//! Downstream port handling

use super::{
    HubId, PortChange, PortFeature, PortStatus, RESET_POLL_MS, RESET_RECOVERY_MS,
    RESET_TIMEOUT_MS,
};
use crate::device::{DeviceId, Speed};
use crate::setup::SetupPacket;
use crate::{Error, Host, HostController, Kernel, Result};
use usb_device::{
    control::{Recipient, Request, RequestType},
    UsbDirection,
};

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Set or clear a port feature
    pub(crate) fn hub_port_feature(
        &self,
        device: DeviceId,
        port: u8,
        feature: PortFeature,
        set: bool,
    ) -> Result<()> {
        let request = if set {
            Request::SET_FEATURE
        } else {
            Request::CLEAR_FEATURE
        };
        self.control_transfer(
            Some(device),
            SetupPacket::new(
                UsbDirection::Out,
                RequestType::Class,
                Recipient::Other,
                request,
                feature as u16,
                u16::from(port),
            ),
            &mut [],
        )
        .map(|_| ())
    }

    /// Read a port's status and change words, and record them
    fn hub_port_status(&self, hub: HubId, port: u8) -> Result<(PortStatus, PortChange)> {
        let device = self.hub_device(hub)?;
        if port == 0 || port > self.hub_port_count(hub) {
            warn!("Hub {} has no port {}", device.address(), port);
            return Err(Error::Failed);
        }

        let mut buffer = [0u8; 4];
        self.control_transfer(
            Some(device),
            SetupPacket::new(
                UsbDirection::In,
                RequestType::Class,
                Recipient::Other,
                Request::GET_STATUS,
                0,
                u16::from(port),
            ),
            &mut buffer,
        )?;
        let status = PortStatus::from_bits_retain(u16::from_le_bytes([buffer[0], buffer[1]]));
        let change = PortChange::from_bits_retain(u16::from_le_bytes([buffer[2], buffer[3]]));

        self.with_hub_mut(hub, |extension| {
            if let Some(record) = extension.ports.get_mut(usize::from(port)) {
                record.status = status;
                record.change = change;
            }
        });
        Ok((status, change))
    }

    /// Reset a port, and wait for the reset to finish
    ///
    /// Returns the port status after reset.
    fn hub_port_reset(&self, hub: HubId, port: u8) -> Result<PortStatus> {
        let device = self.hub_device(hub)?;
        if let Err(err) = self.hub_port_feature(device, port, PortFeature::Reset, true) {
            warn!("Error when starting reset of hub {} port {}", device.address(), port);
            return Err(err);
        }

        let mut waited = 0;
        let status = loop {
            self.kernel.delay_ms(RESET_POLL_MS);
            waited += RESET_POLL_MS;

            let (status, _) = self.hub_port_status(hub, port)?;
            if !status.contains(PortStatus::RESET) {
                break status;
            }
            trace!("Hub {} port {} still in reset", device.address(), port);
            if waited >= RESET_TIMEOUT_MS {
                warn!("Reset of hub {} port {} timed out", device.address(), port);
                return Err(Error::Timeout);
            }
        };

        for _ in 0..3 {
            self.kernel.delay_ms(RESET_RECOVERY_MS);
        }
        Ok(status)
    }

    /// Reset a port, and enumerate the device behind it
    fn hub_port_attach(&'static self, hub: HubId, port: u8) -> Result<()> {
        let hub_device = self.hub_device(hub)?;
        info!("Attaching USB device to hub {} port {}", hub_device.address(), port);

        let status = self.hub_port_reset(hub, port).map_err(|err| {
            warn!("Error when resetting hub {} port {}", hub_device.address(), port);
            err
        })?;
        let speed = if status.contains(PortStatus::LOW_SPEED) {
            Speed::Low
        } else if status.contains(PortStatus::HIGH_SPEED) {
            Speed::High
        } else {
            Speed::Full
        };
        debug!("Hub {} port {} is {:?} speed", hub_device.address(), port, speed);

        let Some(device) = self.allocate_device(Some(hub_device)) else {
            warn!("No room for the device on hub {} port {}", hub_device.address(), port);
            if self.hub_port_feature(hub_device, port, PortFeature::Enable, false).is_err() {
                warn!("Error when disabling hub {} port {}", hub_device.address(), port);
            }
            return Err(Error::Exhausted);
        };
        self.with_device_mut(device, |dev| dev.set_speed(speed));
        self.hub_set_port_child(hub, port, Some(device));

        if let Err(err) = self.enumerate(device) {
            warn!(
                "Error during attachment of device on hub {} port {}",
                hub_device.address(),
                port
            );
            self.hub_port_detach(hub, port);
            return Err(err);
        }
        Ok(())
    }

    /// Disable a port, and release the subtree behind it
    fn hub_port_detach(&self, hub: HubId, port: u8) {
        let Ok(hub_device) = self.hub_device(hub) else {
            return;
        };
        info!("Detaching USB device from hub {} port {}", hub_device.address(), port);

        if self.hub_port_feature(hub_device, port, PortFeature::Enable, false).is_err() {
            warn!("Error when disabling hub {} port {}", hub_device.address(), port);
        }
        if let Some(child) = self.hub_port_child(hub, port) {
            self.hub_set_port_child(hub, port, None);
            self.release_tree(child);
        }
    }

    fn hub_port_acknowledge(&self, hub_device: DeviceId, port: u8, feature: PortFeature) {
        if self.hub_port_feature(hub_device, port, feature, false).is_err() {
            warn!(
                "Error when acknowledging {:?} on hub {} port {}",
                feature,
                hub_device.address(),
                port
            );
        }
    }

    /// Handle a change reported for one port
    pub(crate) fn hub_port_changed(&'static self, hub: HubId, port: u8) {
        let Ok(hub_device) = self.hub_device(hub) else {
            return;
        };
        let (status, change) = match self.hub_port_status(hub, port) {
            Ok(status) => status,
            Err(_) => {
                warn!("Error when reading status of hub {} port {}", hub_device.address(), port);
                return;
            }
        };
        info!(
            "Processing hub {} port {} change: {:?} {:?}",
            hub_device.address(),
            port,
            status,
            change
        );

        if change.contains(PortChange::CONNECTION) {
            self.hub_port_acknowledge(hub_device, port, PortFeature::CConnection);
            if self.hub_port_child(hub, port).is_some() {
                self.hub_port_detach(hub, port);
            }
            if status.contains(PortStatus::CONNECTION) {
                // Failures are logged, and leave the port detached.
                let _ = self.hub_port_attach(hub, port);
            }
        }
        if change.contains(PortChange::RESET) {
            self.hub_port_acknowledge(hub_device, port, PortFeature::CReset);
        }
        if change.contains(PortChange::ENABLE) {
            self.hub_port_acknowledge(hub_device, port, PortFeature::CEnable);
        }
        if change.contains(PortChange::OVER_CURRENT) {
            warn!("Over-current on hub {} port {}", hub_device.address(), port);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::hub::{PortChange, PortStatus, RESET_TIMEOUT_MS};
    use crate::sim::{self, SimDevice};
    use crate::{Error, Speed};
    use usb_device::control::Request;

    #[test]
    fn status_is_recorded() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        bus.attach(0, 2, SimDevice::function(0x1209, 64));

        let (status, change) = host.hub_port_status(hub, 2).unwrap();
        assert!(status.contains(PortStatus::CONNECTION | PortStatus::POWER));
        assert_eq!(change, PortChange::CONNECTION);
        let port = host.hub_port(hub, 2).unwrap();
        assert_eq!(port.status, status);
        assert_eq!(port.change, change);

        assert_eq!(host.hub_port_status(hub, 3), Err(Error::Failed));
    }

    #[test]
    fn reset_times_out() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        bus.attach(0, 1, SimDevice::function(0x1209, 64));
        bus.with_bus(|bus| bus.devices[0].hub.as_mut().unwrap().ports[1].stuck_in_reset = true);

        let delayed = host.kernel().delayed_ms();
        assert_eq!(host.hub_port_attach(hub, 1), Err(Error::Timeout));
        assert!(host.kernel().delayed_ms() - delayed >= RESET_TIMEOUT_MS);
        assert_eq!(host.device_count(), 1);
        assert!(host.hub_port(hub, 1).unwrap().child.is_none());
    }

    #[test]
    fn attach_derives_speed_from_status() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        bus.attach(0, 1, SimDevice::function(0x1209, 8));
        bus.with_bus(|bus| {
            bus.devices[0].hub.as_mut().unwrap().ports[1].speed = PortStatus::LOW_SPEED.bits()
        });

        host.hub_port_attach(hub, 1).unwrap();
        let child = host.port_child(root, 1).unwrap();
        host.with_device(child, |dev| {
            assert_eq!(dev.speed(), Speed::Low);
            assert_eq!(dev.parent(), Some(root));
        })
        .unwrap();
    }

    #[test]
    fn attach_failure_disables_port() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        let mut device = SimDevice::function(0x1209, 64);
        device.stall_request = Some(Request::SET_CONFIGURATION);
        bus.attach(0, 1, device);

        assert_eq!(host.hub_port_attach(hub, 1), Err(Error::Stall));
        assert_eq!(host.device_count(), 1);
        assert!(host.port_child(root, 1).is_none());
        // CLEAR_FEATURE(PORT_ENABLE)
        assert_eq!(bus.count_requests(Request::CLEAR_FEATURE, 1, 1), 1);
    }

    #[test]
    fn attach_with_full_table_disables_port() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        bus.attach(0, 1, SimDevice::function(0x1209, 64));
        while host.allocate_device(Some(root)).is_some() {}

        assert_eq!(host.hub_port_attach(hub, 1), Err(Error::Exhausted));
        assert!(host.port_child(root, 1).is_none());
        assert_eq!(bus.count_requests(Request::CLEAR_FEATURE, 1, 1), 1);
    }

    #[test]
    fn change_acknowledged_without_device() {
        let (host, bus) = sim::host_with_root_hub(2);
        host.init().unwrap();
        let root = host.root().unwrap();
        let hub = host.with_device(root, |dev| dev.hub()).flatten().unwrap();
        bus.with_bus(|bus| {
            let port = &mut bus.devices[0].hub.as_mut().unwrap().ports[2];
            port.change = (PortChange::ENABLE | PortChange::OVER_CURRENT).bits();
        });

        host.hub_port_changed(hub, 2);
        // C_PORT_ENABLE acknowledged; over-current only logged
        assert_eq!(bus.count_requests(Request::CLEAR_FEATURE, 17, 2), 1);
        assert_eq!(bus.count_requests(Request::CLEAR_FEATURE, 19, 2), 0);
        assert_eq!(host.device_count(), 1);
    }
}
