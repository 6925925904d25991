//! The USB host
//!
//! [`Host`] owns the device table, the hub table, and the state shared
//! with transfer completions. Completions may run in interrupt handlers,
//! so all of that state lives behind interrupt-safe mutexes. Critical
//! sections come from the [`Kernel`]'s interrupt masking, and they're
//! never held across a blocking call.

use crate::device::{Device, DeviceId};
use crate::hub::HubPool;
use crate::pool::DevicePool;
use crate::request::Request;
use crate::{Error, HostController, Kernel, Result};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cell::{Cell, RefCell};
use cortex_m::interrupt::{CriticalSection, Mutex};

/// A USB host
///
/// The host drives one [`HostController`]. Create it in a `static`, since
/// transfer callbacks and the hub worker thread keep references to it.
///
/// # Example
///
/// ```no_run
/// # use usbh_core::{Host, HostController, Kernel, Semaphore, Request, Result};
/// # struct Sem; impl Semaphore for Sem { fn wait(&self) {} fn signal(&self) {} }
/// # struct MyKernel;
/// # unsafe impl Kernel for MyKernel {
/// #     type Semaphore = Sem;
/// #     fn create_semaphore(&self, _: u32) -> Option<Sem> { Some(Sem) }
/// #     fn spawn(&self, _: Box<dyn FnOnce() + Send>) -> Result<()> { Ok(()) }
/// #     fn delay_ms(&self, _: u32) {}
/// #     fn interrupts_disable(&self) -> u32 { 0 }
/// #     fn interrupts_restore(&self, _: u32) {}
/// # }
/// # struct Dwc2;
/// # impl HostController for Dwc2 {
/// #     fn start(&self) -> Result<()> { Ok(()) }
/// #     fn submit(&self, request: Box<Request>) { }
/// # }
/// static HOST: Host<Dwc2, MyKernel> = Host::new(Dwc2, MyKernel);
///
/// // Starts the controller, then enumerates the root hub.
/// HOST.init().unwrap();
/// ```
pub struct Host<H, K: Kernel> {
    pub(crate) controller: H,
    pub(crate) kernel: K,
    pub(crate) devices: Mutex<RefCell<DevicePool>>,
    pub(crate) hubs: Mutex<RefCell<HubPool>>,
    /// One bit per hub with an unprocessed status change
    pub(crate) pending: Mutex<Cell<u32>>,
    /// Signaled once per hub status change; created with the hub worker
    pub(crate) worker: Mutex<RefCell<Option<Arc<K::Semaphore>>>>,
    root: Mutex<Cell<Option<DeviceId>>>,
}

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Create a host
    ///
    /// Nothing happens until you call [`init()`](Host::init).
    pub const fn new(controller: H, kernel: K) -> Self {
        Host {
            controller,
            kernel,
            devices: Mutex::new(RefCell::new(DevicePool::max_devices())),
            hubs: Mutex::new(RefCell::new(HubPool::new())),
            pending: Mutex::new(Cell::new(0)),
            worker: Mutex::new(RefCell::new(None)),
            root: Mutex::new(Cell::new(None)),
        }
    }

    pub fn controller(&self) -> &H {
        &self.controller
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Run `func` with interrupts masked
    pub(crate) fn free<R>(&self, func: impl FnOnce(&CriticalSection) -> R) -> R {
        let state = self.kernel.interrupts_disable();
        // Safety: the Kernel contract guarantees that nothing else touches
        // our state until interrupts are restored.
        let cs = unsafe { CriticalSection::new() };
        let result = func(&cs);
        self.kernel.interrupts_restore(state);
        result
    }

    /// Interrupt-safe, mutable access to the device table
    pub(crate) fn with_devices<R>(&self, func: impl FnOnce(&mut DevicePool) -> R) -> R {
        self.free(|cs| {
            let devices = self.devices.borrow(cs);
            let mut devices = devices.borrow_mut();
            func(&mut devices)
        })
    }

    /// Interrupt-safe, immutable access to a live device
    ///
    /// Returns `None` if `id` doesn't name a live device.
    pub fn with_device<R>(&self, id: DeviceId, func: impl FnOnce(&Device) -> R) -> Option<R> {
        self.with_devices(|devices| devices.get(id).map(func))
    }

    pub(crate) fn with_device_mut<R>(
        &self,
        id: DeviceId,
        func: impl FnOnce(&mut Device) -> R,
    ) -> Option<R> {
        self.with_devices(|devices| devices.get_mut(id).map(func))
    }

    /// Number of live devices, including the root
    pub fn device_count(&self) -> usize {
        self.with_devices(|devices| devices.len())
    }

    /// The root device, once [`init()`](Host::init) attached it
    pub fn root(&self) -> Option<DeviceId> {
        self.free(|cs| self.root.borrow(cs).get())
    }

    /// Allocate a device under `parent`
    ///
    /// The device's bus address is fixed by its slot; see [`DeviceId::address()`].
    /// Returns `None` if the device table is full.
    pub fn allocate_device(&self, parent: Option<DeviceId>) -> Option<DeviceId> {
        let id = self.with_devices(|devices| devices.allocate(parent));
        if let Some(id) = id {
            debug!("ALLOC DEVICE {} (parent {:?})", id.address(), parent);
        } else {
            warn!("Device table exhausted");
        }
        id
    }

    /// Free a device, and its configuration block
    ///
    /// Descendants and hub extensions are left alone. Use
    /// [`release_tree()`](Host::release_tree) to tear down a subtree.
    pub fn free_device(&self, id: DeviceId) {
        // The configuration block drops with interrupts masked.
        self.with_devices(|devices| drop(devices.free(id)));
        debug!("FREE DEVICE {}", id.address());
    }

    /// Allocate a transfer request with a `size` byte data buffer
    pub fn allocate_request(&self, size: usize) -> Option<Box<Request>> {
        self.free(|_| Request::allocate(size))
    }

    /// Free a transfer request
    pub fn free_request(&self, request: Box<Request>) {
        self.release(request);
    }

    /// Allocate a zeroed buffer with interrupts masked
    pub(crate) fn allocate_buffer(&self, len: usize) -> Result<Vec<u8>> {
        self.free(|_| {
            let mut buffer = Vec::new();
            buffer.try_reserve_exact(len).map_err(|_| Error::Exhausted)?;
            buffer.resize(len, 0);
            Ok(buffer)
        })
    }

    /// Drop `value` with interrupts masked
    pub(crate) fn release<T>(&self, value: T) {
        self.free(|_| drop(value));
    }

    /// Submit a request to the host controller
    ///
    /// The request's status and transfer count reset before submission.
    /// The request comes back through its callback. A request without a
    /// callback is freed instead of submitted.
    pub fn submit(&self, mut request: Box<Request>) {
        if request.callback().is_none() {
            warn!("Request for {} has no callback", request.address());
            self.free_request(request);
            return;
        }
        request.reset();
        trace!(
            "SUBMIT {} {:?} {}",
            request.address(),
            request.setup().direction,
            request.size()
        );
        self.controller.submit(request);
    }

    /// Start the host controller, and enumerate the root device
    ///
    /// If the root is a hub, the hub driver binds to it, and the bus starts
    /// discovering devices.
    pub fn init(&'static self) -> Result<()> {
        if let Err(err) = self.controller.start() {
            error!("USB core failed to start the host controller");
            return Err(err);
        }

        let root = self.allocate_device(None).ok_or_else(|| {
            error!("USB core failed to allocate the root hub");
            Error::Exhausted
        })?;
        self.free(|cs| self.root.borrow(cs).set(Some(root)));

        if let Err(err) = self.enumerate(root) {
            error!("USB core failed to attach the root hub");
            self.release_tree(root);
            return Err(err);
        }

        info!("USB core initialization complete");
        Ok(())
    }

    /// Walk the tree rooted at `device`
    ///
    /// Children are visited before their parent, in ascending port order,
    /// so `visit` may free each device it sees. Nothing happens if `device`
    /// isn't live.
    pub fn for_each<F: FnMut(DeviceId)>(&self, device: DeviceId, visit: &mut F) {
        let Some(hub) = self.with_device(device, Device::hub) else {
            return;
        };
        if let Some(hub) = hub {
            for port in 1..=self.hub_port_count(hub) {
                if let Some(child) = self.hub_port_child(hub, port) {
                    self.for_each(child, visit);
                }
            }
        }
        visit(device);
    }

    /// Free `device` and everything below it
    ///
    /// Hub extensions in the subtree are released along with their
    /// devices.
    pub fn release_tree(&self, device: DeviceId) {
        self.for_each(device, &mut |id| self.release_device(id));
    }

    fn release_device(&self, id: DeviceId) {
        if let Some(Some(hub)) = self.with_device(id, Device::hub) {
            self.hub_free(hub);
        }
        self.free(|cs| {
            let root = self.root.borrow(cs);
            if root.get() == Some(id) {
                root.set(None);
            }
        });
        self.free_device(id);
    }
}
