//! Fixed-capacity device table
//!
//! The table owns every device by slot. Everything else (parents, hub
//! ports, the root) refers to devices by [`DeviceId`]. The host keeps
//! the table behind an interrupt-safe mutex; the methods here assume the
//! caller holds that critical section.

use crate::device::{Device, DeviceId};
use crate::MAX_DEVICES;

/// Device storage
///
/// Use [`max_devices()`](DevicePool::max_devices) unless you have a reason
/// to pick a smaller table. `COUNT` beyond 255 is wasted; device IDs are
/// one byte.
pub struct DevicePool<const COUNT: usize = MAX_DEVICES> {
    slots: [Option<Device>; COUNT],
}

impl DevicePool<MAX_DEVICES> {
    pub const fn max_devices() -> Self {
        Self::new()
    }
}

impl<const COUNT: usize> DevicePool<COUNT> {
    pub const fn new() -> Self {
        const EMPTY: Option<Device> = None;
        DevicePool {
            slots: [EMPTY; COUNT],
        }
    }

    /// Allocate a zero-initialized device under `parent`
    ///
    /// Returns `None` if every slot is in use.
    pub fn allocate(&mut self, parent: Option<DeviceId>) -> Option<DeviceId> {
        let (index, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())?;
        let id = DeviceId(u8::try_from(index).ok().filter(|idx| *idx < u8::MAX)?);
        *slot = Some(Device::new(parent));
        Some(id)
    }

    /// Release the slot, returning the device that occupied it
    ///
    /// The caller decides where the device (and its configuration block)
    /// is dropped. Children are not touched.
    pub fn free(&mut self, id: DeviceId) -> Option<Device> {
        self.slots.get_mut(id.index())?.take()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Number of live devices
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        COUNT
    }

    /// Iterate over live devices
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, &Device)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| Some((DeviceId(index as u8), slot.as_ref()?)))
    }
}

impl<const COUNT: usize> Default for DevicePool<COUNT> {
    fn default() -> Self {
        Self::new()
    }
}
