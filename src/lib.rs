//! A USB 2.0 host core for bare-metal kernels
//!
//! `usbh-core` sits between a host controller driver and USB class drivers.
//! It enumerates devices, maintains the device tree through hubs, and
//! offers a blocking control-transfer primitive. See [`Host`] for usage.
//!
//! The crate doesn't touch hardware. You provide
//!
//! - a [`HostController`] that performs transfers, and completes them
//!   (possibly from an interrupt handler),
//! - a [`Kernel`] that supplies semaphores, a thread, delays, and interrupt
//!   masking,
//! - a global allocator, for descriptor blocks and transfer buffers.
//!
//! Diagnostics go through the [`log`](https://crates.io/crates/log) facade
//! when the `log` feature (default) is enabled.

#![no_std]

extern crate alloc;

#[macro_use]
mod log;

mod control;
mod enumeration;
mod host;
mod pool;
mod status;

pub mod descriptor;
pub mod device;
pub mod hub;
pub mod request;
pub mod setup;

#[cfg(test)]
mod sim;

use alloc::boxed::Box;

pub use device::{Device, DeviceId, Speed};
pub use host::Host;
pub use pool::DevicePool;
pub use request::Request;
pub use setup::SetupPacket;
pub use status::{Error, Result, Status};

/// Capacity of the device table
pub const MAX_DEVICES: usize = 32;

/// Capacity of the hub table
///
/// Each hub owns one bit of the pending-change bitmap, so this can't
/// exceed 32.
pub const MAX_HUBS: usize = 32;

/// Primary interfaces recorded per configuration
pub const MAX_INTERFACES: usize = 8;

/// Endpoints recorded per interface
pub const MAX_ENDPOINTS: usize = 8;

/// Default control pipe packet size, used until the device reports its own
///
/// This is the only size every device supports, and it's enough to read the
/// first eight bytes of the device descriptor.
pub const DEFAULT_MAX_PACKET_SIZE: u16 = 8;

const _: [(); 1] = [(); (MAX_HUBS <= 32) as usize];
const _: [(); 1] = [(); (MAX_DEVICES < 256) as usize];

/// A host controller driver
///
/// The controller accepts transfer requests and runs them on the bus. It
/// must complete every submitted request exactly once by calling
/// [`Request::complete()`], whether the transfer succeeded or not. Completion
/// may happen in the submitting thread, another thread, or an interrupt
/// handler.
pub trait HostController: Sync {
    /// Start the controller and its root port(s)
    fn start(&self) -> Result<()>;
    /// Schedule a request
    ///
    /// The controller owns the request until it completes it.
    fn submit(&self, request: Box<Request>);
}

/// A counting semaphore
///
/// Dropping the semaphore destroys it.
pub trait Semaphore: Send + Sync {
    /// Block the calling thread until the count is non-zero, then
    /// decrement it
    fn wait(&self);
    /// Increment the count, waking a waiter
    ///
    /// Must be callable from interrupt handlers.
    fn signal(&self);
}

/// Kernel services used by the host core
///
/// # Safety
///
/// `interrupts_disable()` must prevent every interrupt handler and every
/// other thread that could complete transfers from running, until the
/// matching `interrupts_restore()`. The host relies on this to hand out
/// critical sections. Calls may nest.
///
/// # Example
///
/// A sketch of a kernel on a single core Cortex-M, assuming your scheduler
/// provides semaphores and threads.
///
/// ```no_run
/// # use usbh_core::{Kernel, Semaphore, Result};
/// # struct Sem; impl Semaphore for Sem { fn wait(&self) {} fn signal(&self) {} }
/// # fn sem_create(_: u32) -> Option<Sem> { None }
/// # fn thread_create(_: Box<dyn FnOnce() + Send>) -> Result<()> { Ok(()) }
/// # fn busy_wait_ms(_: u32) {}
/// struct MyKernel;
///
/// unsafe impl Kernel for MyKernel {
///     type Semaphore = Sem;
///     fn create_semaphore(&self, initial: u32) -> Option<Sem> {
///         sem_create(initial)
///     }
///     fn spawn(&self, entry: Box<dyn FnOnce() + Send>) -> Result<()> {
///         thread_create(entry)
///     }
///     fn delay_ms(&self, ms: u32) {
///         busy_wait_ms(ms)
///     }
///     fn interrupts_disable(&self) -> u32 {
///         let primask = cortex_m::register::primask::read();
///         cortex_m::interrupt::disable();
///         primask.is_active() as u32
///     }
///     fn interrupts_restore(&self, state: u32) {
///         if state != 0 {
///             unsafe { cortex_m::interrupt::enable() };
///         }
///     }
/// }
/// ```
pub unsafe trait Kernel: Sync {
    /// The kernel's semaphore type
    type Semaphore: Semaphore + 'static;

    /// Create a semaphore with an initial count
    ///
    /// Returns `None` if the kernel is out of semaphores.
    fn create_semaphore(&self, initial: u32) -> Option<Self::Semaphore>;

    /// Run `entry` in a new thread
    fn spawn(&self, entry: Box<dyn FnOnce() + Send>) -> Result<()>;

    /// Block, or busy wait, for at least `ms` milliseconds
    fn delay_ms(&self, ms: u32);

    /// Mask interrupts, returning the state to restore
    fn interrupts_disable(&self) -> u32;

    /// Restore the interrupt state returned by `interrupts_disable()`
    fn interrupts_restore(&self, state: u32);
}
