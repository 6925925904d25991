//! Blocking control transfers

use crate::device::DeviceId;
use crate::request::{Callback, Request};
use crate::setup::SetupPacket;
use crate::{Error, Host, HostController, Kernel, Result, Semaphore, Speed, DEFAULT_MAX_PACKET_SIZE};
use alloc::{boxed::Box, sync::Arc};
use core::{
    ptr,
    sync::atomic::{self, AtomicPtr, Ordering},
};

/// How long to sleep while the completing context lets go of the callback
const RELEASE_POLL_MS: u32 = 1;
use usb_device::UsbDirection;

/// Hands a completed request from the callback to the waiting thread
struct Handoff(AtomicPtr<Request>);

impl Handoff {
    const fn new() -> Self {
        Handoff(AtomicPtr::new(ptr::null_mut()))
    }

    /// Park a completed request
    ///
    /// A control request is submitted once, and completes once, so the
    /// slot is always empty here.
    fn put(&self, request: Box<Request>) {
        let previous = self.0.swap(Box::into_raw(request), Ordering::AcqRel);
        debug_assert!(previous.is_null(), "control request completed twice");
        if !previous.is_null() {
            // Safety: only put() stores non-null pointers, and they come from
            // Box::into_raw.
            drop(unsafe { Box::from_raw(previous) });
        }
    }

    fn take(&self) -> Option<Box<Request>> {
        let request = self.0.swap(ptr::null_mut(), Ordering::AcqRel);
        // Safety: see put(). The swap makes us the only owner.
        (!request.is_null()).then(|| unsafe { Box::from_raw(request) })
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        drop(self.take());
    }
}

/// State shared between a blocked caller and its transfer callback
struct Completion<S> {
    semaphore: S,
    handoff: Handoff,
}

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Perform a control transfer, and block until it completes
    ///
    /// `device` selects the target. `None` targets the default address,
    /// with an eight byte control pipe. The data stage direction, and
    /// its length, come from `setup.direction` and `data`. The length
    /// in `setup` is ignored.
    ///
    /// For IN transfers, the received bytes are copied to the front of
    /// `data`. Returns the number of bytes transferred.
    ///
    /// Don't call this from an interrupt handler, or from a transfer
    /// callback.
    pub fn control_transfer(
        &self,
        device: Option<DeviceId>,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> Result<usize> {
        let Ok(length) = u16::try_from(data.len()) else {
            warn!("Control transfer of {} bytes doesn't fit wLength", data.len());
            return Err(Error::Failed);
        };

        let (address, speed, max_packet_size) = match device {
            Some(id) => self
                .with_device(id, |dev| {
                    let max_packet_size = match dev.max_packet_size0() {
                        0 => DEFAULT_MAX_PACKET_SIZE,
                        size => size,
                    };
                    (dev.address(), dev.speed(), max_packet_size)
                })
                .ok_or(Error::Failed)?,
            None => (0, Speed::Full, DEFAULT_MAX_PACKET_SIZE),
        };

        let Some(mut request) = self.allocate_request(data.len()) else {
            warn!("Error allocating control transfer request");
            return Err(Error::Exhausted);
        };
        let Some(semaphore) = self.kernel.create_semaphore(0) else {
            warn!("Error creating control transfer semaphore");
            self.free_request(request);
            return Err(Error::Exhausted);
        };
        let completion = self.free(|_| {
            Arc::new(Completion {
                semaphore,
                handoff: Handoff::new(),
            })
        });

        request.set_target(device, address, speed, max_packet_size);
        request.set_endpoint(None);
        request.set_setup(SetupPacket { length, ..setup });
        if setup.direction == UsbDirection::Out {
            request.data_mut().copy_from_slice(data);
        }
        let waiter = Arc::clone(&completion);
        let callback = self.free(|_| -> Callback {
            Arc::new(move |request: Box<Request>| {
                waiter.handoff.put(request);
                waiter.semaphore.signal();
            })
        });
        request.set_callback(Arc::clone(&callback));

        self.submit(request);
        completion.semaphore.wait();

        // The completing context still runs the callback after the wake up.
        // Once it drops its reference, the semaphore is ours to destroy.
        while Arc::strong_count(&callback) > 1 {
            self.kernel.delay_ms(RELEASE_POLL_MS);
        }
        atomic::fence(Ordering::Acquire);
        self.release(callback);

        let Some(request) = completion.handoff.take() else {
            error!("Control transfer signaled without a request");
            self.release(completion);
            return Err(Error::Failed);
        };
        let status = request.status();
        let transferred = request.transferred();
        if setup.direction == UsbDirection::In {
            data[..transferred].copy_from_slice(request.transferred_data());
        }

        self.free_request(request);
        self.release(completion);

        status.into_result().map(|()| transferred)
    }
}
