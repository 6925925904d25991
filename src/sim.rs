//! A simulated kernel, host controller, and bus
//!
//! Control transfers complete synchronously, in the submitting thread,
//! unless [`SimController::complete_in_threads()`] moves them to a thread
//! of their own. Interrupt transfers park until a test completes them with
//! [`SimController::fire()`] or [`SimController::fail_interrupts()`].
//! The kernel never runs spawned threads; tests drive the hub worker
//! with [`Host::hub_worker_step()`].

extern crate std;

use crate::hub::{status_bitmap_size, HubDescriptor, PortChange, PortFeature, PortStatus};
use crate::request::Request;
use crate::setup::SetupPacket;
use crate::{Error, Host, HostController, Kernel, Result, Semaphore, Status};
use alloc::{
    boxed::Box,
    sync::{Arc, Weak},
    vec::Vec,
};
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicUsize, Ordering};
use std::{sync::Mutex, thread, time::Duration};
use usb_device::{
    control::{self, Recipient, RequestType},
    descriptor::descriptor_type,
};

pub type SimHost = Host<SimController, SimKernel>;

/// A leaked host, driving a root hub with `ports` ports
pub fn host_with_root_hub(ports: u8) -> (&'static SimHost, &'static SimController) {
    let host: &'static SimHost = Box::leak(Box::new(Host::new(
        SimController::new(SimDevice::hub(ports)),
        SimKernel::new(),
    )));
    (host, host.controller())
}

pub struct SimSemaphore {
    count: AtomicU32,
    live: Arc<AtomicIsize>,
    /// `Some` once the kernel runs threads: wait() blocks, and signal()
    /// sleeps this long after waking the waiter.
    linger: Option<Duration>,
}

impl SimSemaphore {
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Semaphore for SimSemaphore {
    fn wait(&self) {
        loop {
            let taken = self
                .count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1));
            if taken.is_ok() {
                return;
            }
            assert!(self.linger.is_some(), "wait() on an unsignaled semaphore blocks forever");
            thread::yield_now();
        }
    }

    fn signal(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        if let Some(linger) = self.linger {
            thread::sleep(linger);
        }
    }
}

impl Drop for SimSemaphore {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SimKernel {
    live: Arc<AtomicIsize>,
    delayed: AtomicU32,
    spawned: AtomicUsize,
    fail_semaphores: AtomicBool,
    masked: AtomicU32,
    linger: Mutex<Option<Duration>>,
}

impl SimKernel {
    pub fn new() -> Self {
        SimKernel {
            live: Arc::new(AtomicIsize::new(0)),
            delayed: AtomicU32::new(0),
            spawned: AtomicUsize::new(0),
            fail_semaphores: AtomicBool::new(false),
            masked: AtomicU32::new(0),
            linger: Mutex::new(None),
        }
    }

    /// Semaphores created, and not yet dropped
    pub fn live_semaphores(&self) -> isize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total milliseconds spent in delay_ms()
    pub fn delayed_ms(&self) -> u32 {
        self.delayed.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn fail_semaphores(&self, fail: bool) {
        self.fail_semaphores.store(fail, Ordering::SeqCst);
    }

    /// Behave like a kernel running other threads
    ///
    /// Semaphores block in wait(), and sleep for `linger` in signal() after
    /// the waiter can run. delay_ms() really sleeps.
    pub fn run_threads(&self, linger: Duration) {
        *self.linger.lock().unwrap() = Some(linger);
    }

    fn threaded(&self) -> bool {
        self.linger.lock().unwrap().is_some()
    }
}

unsafe impl Kernel for SimKernel {
    type Semaphore = SimSemaphore;

    fn create_semaphore(&self, initial: u32) -> Option<SimSemaphore> {
        if self.fail_semaphores.load(Ordering::SeqCst) {
            return None;
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(SimSemaphore {
            count: AtomicU32::new(initial),
            live: Arc::clone(&self.live),
            linger: *self.linger.lock().unwrap(),
        })
    }

    fn spawn(&self, entry: Box<dyn FnOnce() + Send>) -> Result<()> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        drop(entry);
        Ok(())
    }

    fn delay_ms(&self, ms: u32) {
        self.delayed.fetch_add(ms, Ordering::SeqCst);
        if self.threaded() {
            thread::sleep(Duration::from_millis(u64::from(ms)));
        }
    }

    fn interrupts_disable(&self) -> u32 {
        self.masked.fetch_add(1, Ordering::SeqCst)
    }

    fn interrupts_restore(&self, state: u32) {
        self.masked.store(state, Ordering::SeqCst);
    }
}

/// A downstream port of a simulated hub
#[derive(Debug, Default)]
pub struct SimPort {
    pub status: u16,
    pub change: u16,
    /// Index of the attached device in [`SimBus::devices`]
    pub device: Option<usize>,
    /// Never finish a port reset
    pub stuck_in_reset: bool,
    /// Speed bits reported once the port is enabled
    pub speed: u16,
}

pub struct SimHub {
    pub descriptor: Vec<u8>,
    /// Indexed by port number; entry 0 is unused.
    pub ports: Vec<SimPort>,
}

impl SimHub {
    fn new(ports: u8) -> Self {
        let masks = status_bitmap_size(ports);
        let mut descriptor = alloc::vec![
            (7 + 2 * masks) as u8,
            HubDescriptor::TYPE,
            ports,
            0x09,
            0x00,
            50,
            100,
        ];
        descriptor.resize(7 + masks, 0x00);
        descriptor.resize(7 + 2 * masks, 0xFF);
        SimHub {
            descriptor,
            ports: (0..=ports).map(|_| SimPort::default()).collect(),
        }
    }
}

pub struct SimDevice {
    /// `None` while the device can't be reached
    pub address: Option<u8>,
    pub descriptor: [u8; 18],
    pub configuration: Vec<u8>,
    pub hub: Option<SimHub>,
    /// Stall every request with this code
    pub stall_request: Option<u8>,
    /// The value of the last SET_CONFIGURATION
    pub configured: Option<u8>,
}

impl SimDevice {
    /// A single interface, interrupt IN device
    pub fn function(vendor_id: u16, max_packet_size0: u8) -> Self {
        let vendor_id = vendor_id.to_le_bytes();
        SimDevice {
            address: Some(0),
            descriptor: [
                18, 1, 0x00, 0x02, 0, 0, 0, max_packet_size0, vendor_id[0], vendor_id[1], 0x01,
                0x00, 0x00, 0x01, 0, 0, 0, 1,
            ],
            configuration: alloc::vec![
                9, 2, 25, 0, 1, 1, 0, 0x80, 50, // Configuration
                9, 4, 0, 0, 1, 3, 1, 1, 0, // Interface, HID boot keyboard
                7, 5, 0x81, 0x03, 8, 0, 10, // Endpoint 0x81, interrupt
            ],
            hub: None,
            stall_request: None,
            configured: None,
        }
    }

    /// A full speed hub
    pub fn hub(ports: u8) -> Self {
        SimDevice {
            address: Some(0),
            descriptor: [
                18, 1, 0x00, 0x02, 9, 0, 1, 64, 0x24, 0x04, 0x14, 0x25, 0x00, 0x01, 0, 0, 0, 1,
            ],
            configuration: crate::descriptor::tests::hub_like_configuration(),
            hub: Some(SimHub::new(ports)),
            stall_request: None,
            configured: None,
        }
    }
}

pub struct SimBus {
    pub devices: Vec<SimDevice>,
    /// Submitted interrupt requests, waiting for data
    pub interrupts: Vec<Box<Request>>,
    /// Every control request, with its target address
    pub setups: Vec<(u8, SetupPacket)>,
    pub last_callback: Option<Weak<dyn Fn(Box<Request>) + Send + Sync>>,
    pub started: bool,
    pub fail_start: bool,
}

fn reply(data: &mut [u8], bytes: &[u8]) -> (Status, usize) {
    let len = data.len().min(bytes.len());
    data[..len].copy_from_slice(&bytes[..len]);
    (Status::Success, len)
}

impl SimBus {
    fn control(&mut self, request: &mut Request) -> (Status, usize) {
        let setup = *request.setup();
        let address = request.address();
        self.setups.push((address, setup));

        let Some(index) = self
            .devices
            .iter()
            .position(|device| device.address == Some(address))
        else {
            return (Status::Timeout, 0);
        };
        if self.devices[index].stall_request == Some(setup.request) {
            return (Status::Stall, 0);
        }

        let data = request.data_mut();
        let device = &mut self.devices[index];
        match (setup.request_type, setup.recipient, setup.request) {
            (RequestType::Standard, Recipient::Device, control::Request::GET_DESCRIPTOR) => {
                match (setup.value >> 8) as u8 {
                    descriptor_type::DEVICE => reply(data, &device.descriptor),
                    descriptor_type::CONFIGURATION => reply(data, &device.configuration),
                    _ => (Status::Stall, 0),
                }
            }
            (RequestType::Standard, Recipient::Device, control::Request::SET_ADDRESS) => {
                device.address = Some(setup.value as u8);
                (Status::Success, 0)
            }
            (RequestType::Standard, Recipient::Device, control::Request::SET_CONFIGURATION) => {
                device.configured = Some(setup.value as u8);
                (Status::Success, 0)
            }
            (RequestType::Class, Recipient::Device, control::Request::GET_DESCRIPTOR)
                if (setup.value >> 8) as u8 == HubDescriptor::TYPE =>
            {
                match &device.hub {
                    Some(hub) => reply(data, &hub.descriptor),
                    None => (Status::Stall, 0),
                }
            }
            (RequestType::Class, Recipient::Other, _) => self.port_request(index, &setup, data),
            _ => (Status::Stall, 0),
        }
    }

    fn port_request(
        &mut self,
        index: usize,
        setup: &SetupPacket,
        data: &mut [u8],
    ) -> (Status, usize) {
        let port = usize::from(setup.index);
        let Some(record) = self.devices[index]
            .hub
            .as_mut()
            .and_then(|hub| hub.ports.get_mut(port))
            .filter(|_| port > 0)
        else {
            return (Status::Stall, 0);
        };

        // (device index, new address) of the device behind the port
        let mut readdress = None;
        let outcome = match (setup.request, setup.value) {
            (control::Request::GET_STATUS, _) => {
                let status = record.status.to_le_bytes();
                let change = record.change.to_le_bytes();
                reply(data, &[status[0], status[1], change[0], change[1]])
            }
            (control::Request::SET_FEATURE, feature) if feature == PortFeature::Power as u16 => {
                record.status |= PortStatus::POWER.bits();
                (Status::Success, 0)
            }
            (control::Request::SET_FEATURE, feature) if feature == PortFeature::Reset as u16 => {
                if record.stuck_in_reset {
                    record.status |= PortStatus::RESET.bits();
                } else if let Some(device) = record.device {
                    record.status |= PortStatus::ENABLE.bits() | record.speed;
                    record.change |= PortChange::RESET.bits();
                    readdress = Some((device, Some(0)));
                }
                (Status::Success, 0)
            }
            (control::Request::SET_FEATURE, _) => (Status::Success, 0),
            (control::Request::CLEAR_FEATURE, feature) => {
                match feature {
                    f if f == PortFeature::Enable as u16 => {
                        record.status &= !PortStatus::ENABLE.bits();
                        readdress = record.device.map(|device| (device, None));
                    }
                    f if f == PortFeature::CConnection as u16 => {
                        record.change &= !PortChange::CONNECTION.bits()
                    }
                    f if f == PortFeature::CEnable as u16 => {
                        record.change &= !PortChange::ENABLE.bits()
                    }
                    f if f == PortFeature::CReset as u16 => {
                        record.change &= !PortChange::RESET.bits()
                    }
                    f if f == PortFeature::COverCurrent as u16 => {
                        record.change &= !PortChange::OVER_CURRENT.bits()
                    }
                    _ => {}
                }
                (Status::Success, 0)
            }
            _ => (Status::Stall, 0),
        };

        if let Some((device, address)) = readdress {
            self.devices[device].address = address;
        }
        outcome
    }
}

pub struct SimController {
    bus: Mutex<SimBus>,
    threads: AtomicBool,
}

impl SimController {
    pub fn new(root: SimDevice) -> Self {
        SimController {
            bus: Mutex::new(SimBus {
                devices: alloc::vec![root],
                interrupts: Vec::new(),
                setups: Vec::new(),
                last_callback: None,
                started: false,
                fail_start: false,
            }),
            threads: AtomicBool::new(false),
        }
    }

    pub fn with_bus<R>(&self, func: impl FnOnce(&mut SimBus) -> R) -> R {
        func(&mut self.bus.lock().unwrap())
    }

    pub fn started(&self) -> bool {
        self.with_bus(|bus| bus.started)
    }

    pub fn fail_start(&self) {
        self.with_bus(|bus| bus.fail_start = true);
    }

    /// Complete control requests from a new thread, not from submit()
    pub fn complete_in_threads(&self) {
        self.threads.store(true, Ordering::SeqCst);
    }

    pub fn parked_interrupts(&self) -> usize {
        self.with_bus(|bus| bus.interrupts.len())
    }

    pub fn setups(&self) -> Vec<(u8, SetupPacket)> {
        self.with_bus(|bus| bus.setups.clone())
    }

    /// Number of control requests with this code, value, and index
    pub fn count_requests(&self, request: u8, value: u16, index: u16) -> usize {
        self.with_bus(|bus| {
            bus.setups
                .iter()
                .filter(|(_, setup)| {
                    setup.request == request && setup.value == value && setup.index == index
                })
                .count()
        })
    }

    pub fn last_setup(&self) -> Option<(u8, SetupPacket)> {
        self.with_bus(|bus| bus.setups.last().copied())
    }

    pub fn last_callback(&self) -> Option<Weak<dyn Fn(Box<Request>) + Send + Sync>> {
        self.with_bus(|bus| bus.last_callback.clone())
    }

    /// Complete the interrupt request parked for `address` with `bitmap`
    ///
    /// Returns `false` if nothing is parked for that address.
    pub fn fire(&self, address: u8, bitmap: &[u8]) -> bool {
        let request = self.with_bus(|bus| {
            let position = bus
                .interrupts
                .iter()
                .position(|request| request.address() == address)?;
            Some(bus.interrupts.remove(position))
        });
        let Some(mut request) = request else {
            return false;
        };
        let len = request.size().min(bitmap.len());
        request.data_mut()[..len].copy_from_slice(&bitmap[..len]);
        request.complete(Status::Success, len);
        true
    }

    /// Complete every parked interrupt request with an error
    pub fn fail_interrupts(&self) {
        let requests = self.with_bus(|bus| core::mem::take(&mut bus.interrupts));
        for request in requests {
            request.complete(Status::Failed, 0);
        }
    }

    /// Connect `device` to `port` of the hub at `hub` in the device list
    pub fn attach(&self, hub: usize, port: u8, mut device: SimDevice) -> usize {
        self.with_bus(|bus| {
            device.address = None;
            let index = bus.devices.len();
            bus.devices.push(device);
            let record = &mut bus.devices[hub].hub.as_mut().unwrap().ports[usize::from(port)];
            record.status |= PortStatus::CONNECTION.bits();
            record.change |= PortChange::CONNECTION.bits();
            record.device = Some(index);
            index
        })
    }

    /// Disconnect whatever is attached to `port` of the hub at `hub`
    pub fn detach(&self, hub: usize, port: u8) {
        self.with_bus(|bus| {
            let record = &mut bus.devices[hub].hub.as_mut().unwrap().ports[usize::from(port)];
            record.status &= !(PortStatus::CONNECTION | PortStatus::ENABLE).bits();
            record.change |= PortChange::CONNECTION.bits();
            if let Some(device) = record.device.take() {
                bus.devices[device].address = None;
            }
        });
    }
}

impl HostController for SimController {
    fn start(&self) -> Result<()> {
        self.with_bus(|bus| {
            if bus.fail_start {
                return Err(Error::Failed);
            }
            bus.started = true;
            Ok(())
        })
    }

    fn submit(&self, mut request: Box<Request>) {
        let request = self.with_bus(|bus| {
            if request.endpoint().is_some() {
                bus.interrupts.push(request);
                return None;
            }
            bus.last_callback = request.callback().map(Arc::downgrade);
            let (status, transferred) = bus.control(&mut request);
            Some((request, status, transferred))
        });
        if let Some((request, status, transferred)) = request {
            if self.threads.load(Ordering::SeqCst) {
                thread::spawn(move || request.complete(status, transferred));
            } else {
                request.complete(status, transferred);
            }
        }
    }
}
