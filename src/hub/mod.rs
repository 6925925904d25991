//! USB hub driver
//!
//! The hub driver binds to hub devices. Once bound, it keeps an interrupt
//! IN request pending on the hub's status change endpoint. When that
//! request completes, the change bitmap is stashed, and a worker thread
//! handles the changed ports: it resets and enumerates new devices, and
//! tears down subtrees that went away.
//!
//! Each bound hub has a hub extension in the hub table. The extension
//! holds the hub descriptor, a per-port record, and the (parked) status
//! change request.

mod descriptor;
mod driver;
mod port;
mod worker;

pub use descriptor::{status_bitmap_size, HubDescriptor, PortChange, PortFeature, PortStatus};

use crate::device::DeviceId;
use crate::request::{Callback, Request};
use crate::{Error, Host, HostController, Kernel, Result, MAX_HUBS};
use alloc::{boxed::Box, vec::Vec};

/// Device and interface class code for hubs
pub const HUB_CLASS: u8 = 9;

/// Highest hub protocol we drive (multiple transaction translators)
pub const HUB_PROTOCOL_MAX: u8 = 2;

/// Port reset status poll interval
pub const RESET_POLL_MS: u32 = 10;

/// Give up on a port reset after this long
pub const RESET_TIMEOUT_MS: u32 = 800;

/// Reset recovery interval, waited three times after reset completes
pub const RESET_RECOVERY_MS: u32 = 10;

/// Handle to a hub extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HubId(pub(crate) u8);

impl HubId {
    pub fn index(self) -> usize {
        usize::from(self.0)
    }

    /// This hub's bit in the pending-change bitmap
    pub(crate) fn bit(self) -> u32 {
        1 << self.0
    }
}

/// What the hub driver knows about one downstream port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Port {
    /// Status from the last GET_STATUS
    pub status: PortStatus,
    /// Change bits from the last GET_STATUS
    pub change: PortChange,
    /// The device attached through this port
    pub child: Option<DeviceId>,
}

impl Port {
    const fn new() -> Self {
        Port {
            status: PortStatus::empty(),
            change: PortChange::empty(),
            child: None,
        }
    }
}

/// A hub extension
pub(crate) struct Hub {
    pub(crate) device: DeviceId,
    /// Distinguishes this binding from earlier users of the same slot
    pub(crate) token: u32,
    pub(crate) descriptor: Option<HubDescriptor>,
    /// Indexed by port number; entry 0 is unused.
    pub(crate) ports: Vec<Port>,
    /// Change bitmap from the last status change completion
    pub(crate) changed: Vec<u8>,
    /// The status change request, while it isn't submitted
    pub(crate) status_request: Option<Box<Request>>,
    /// Installed on the status change request at every submission
    pub(crate) status_callback: Option<Callback>,
}

impl Hub {
    fn new(device: DeviceId, token: u32) -> Self {
        Hub {
            device,
            token,
            descriptor: None,
            ports: Vec::new(),
            changed: Vec::new(),
            status_request: None,
            status_callback: None,
        }
    }

    pub(crate) fn num_ports(&self) -> u8 {
        self.descriptor
            .as_ref()
            .map_or(0, HubDescriptor::num_ports)
    }
}

/// Fixed-capacity hub extension table
pub(crate) struct HubPool {
    slots: [Option<Hub>; MAX_HUBS],
    next_token: u32,
}

impl HubPool {
    pub(crate) const fn new() -> Self {
        const EMPTY: Option<Hub> = None;
        HubPool {
            slots: [EMPTY; MAX_HUBS],
            next_token: 0,
        }
    }

    /// Allocate an empty extension for `device`
    pub(crate) fn allocate(&mut self, device: DeviceId) -> Option<HubId> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);
        *slot = Some(Hub::new(device, token));
        Some(HubId(index as u8))
    }

    pub(crate) fn free(&mut self, id: HubId) -> Option<Hub> {
        self.slots.get_mut(id.index())?.take()
    }

    pub(crate) fn get(&self, id: HubId) -> Option<&Hub> {
        self.slots.get(id.index())?.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: HubId) -> Option<&mut Hub> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

impl<H: HostController, K: Kernel> Host<H, K> {
    pub(crate) fn with_hub<R>(&self, id: HubId, func: impl FnOnce(&Hub) -> R) -> Option<R> {
        self.free(|cs| self.hubs.borrow(cs).borrow().get(id).map(func))
    }

    pub(crate) fn with_hub_mut<R>(&self, id: HubId, func: impl FnOnce(&mut Hub) -> R) -> Option<R> {
        self.free(|cs| self.hubs.borrow(cs).borrow_mut().get_mut(id).map(func))
    }

    /// Number of bound hubs
    pub fn hub_count(&self) -> usize {
        self.free(|cs| self.hubs.borrow(cs).borrow().len())
    }

    /// The device a hub extension belongs to
    pub(crate) fn hub_device(&self, hub: HubId) -> Result<DeviceId> {
        self.with_hub(hub, |hub| hub.device).ok_or(Error::Failed)
    }

    /// Number of downstream ports, or zero if `hub` isn't bound
    pub fn hub_port_count(&self, hub: HubId) -> u8 {
        self.with_hub(hub, Hub::num_ports).unwrap_or(0)
    }

    /// The driver's record of a downstream port
    pub fn hub_port(&self, hub: HubId, port: u8) -> Option<Port> {
        self.with_hub(hub, |hub| hub.ports.get(usize::from(port)).copied())
            .flatten()
            .filter(|_| port > 0)
    }

    pub(crate) fn hub_port_child(&self, hub: HubId, port: u8) -> Option<DeviceId> {
        self.hub_port(hub, port)?.child
    }

    pub(crate) fn hub_set_port_child(&self, hub: HubId, port: u8, child: Option<DeviceId>) {
        self.with_hub_mut(hub, |hub| {
            if let Some(record) = hub.ports.get_mut(usize::from(port)) {
                record.child = child;
            }
        });
    }

    /// The device attached to `port` of the hub `device`
    pub fn port_child(&self, device: DeviceId, port: u8) -> Option<DeviceId> {
        let hub = self.with_device(device, |dev| dev.hub())??;
        self.hub_port_child(hub, port)
    }
}
