//! Hub status change handling
//!
//! The status change completion runs in the controller's completion
//! context. It only records the change bitmap, marks the hub pending, and
//! wakes the worker. The worker thread does the (blocking) port handling,
//! then resubmits the request.

use super::HubId;
use crate::request::Request;
use crate::{Error, Host, HostController, Kernel, Result, Semaphore, Status};
use alloc::{boxed::Box, sync::Arc};

/// Largest change bitmap: the hub, and 255 ports
const MAX_BITMAP: usize = super::status_bitmap_size(u8::MAX);

impl<H: HostController, K: Kernel> Host<H, K> {
    /// Create the worker semaphore, and spawn the worker thread
    ///
    /// Does nothing if the worker is already running.
    pub(crate) fn hub_driver_init(&'static self) -> Result<()> {
        if self.free(|cs| self.worker.borrow(cs).borrow().is_some()) {
            return Ok(());
        }

        let Some(semaphore) = self.kernel.create_semaphore(0) else {
            error!("Error creating hub worker semaphore");
            return Err(Error::Exhausted);
        };
        let semaphore = self.free(|_| Arc::new(semaphore));
        self.free(|cs| *self.worker.borrow(cs).borrow_mut() = Some(semaphore));

        let worker = self.free(|_| {
            Box::new(move || loop {
                self.hub_worker_step();
            })
        });
        if let Err(err) = self.kernel.spawn(worker) {
            error!("Error spawning hub worker");
            let semaphore = self.free(|cs| self.worker.borrow(cs).borrow_mut().take());
            self.release(semaphore);
            return Err(err);
        }

        info!("USB hub worker started");
        Ok(())
    }

    /// Wait for one status change, and handle it
    ///
    /// The worker thread runs this forever. Returns immediately if the
    /// worker was never started.
    pub fn hub_worker_step(&'static self) {
        let Some(semaphore) = self.free(|cs| self.worker.borrow(cs).borrow().clone()) else {
            return;
        };
        semaphore.wait();
        self.release(semaphore);

        match self.take_pending_hub() {
            Some(hub) => self.hub_process(hub),
            None => {
                trace!("Hub worker woke without a pending hub");
            }
        }
    }

    /// Claim the lowest numbered pending hub
    fn take_pending_hub(&self) -> Option<HubId> {
        self.free(|cs| {
            let pending = self.pending.borrow(cs);
            let bits = pending.get();
            if bits == 0 {
                return None;
            }
            let index = bits.trailing_zeros();
            pending.set(bits & !(1 << index));
            Some(HubId(index as u8))
        })
    }

    /// Status change completion
    pub(crate) fn hub_status_changed(&self, hub: HubId, token: u32, request: Box<Request>) {
        let semaphore = self.free(|cs| {
            let mut hubs = self.hubs.borrow(cs).borrow_mut();
            let Some(extension) = hubs.get_mut(hub).filter(|extension| extension.token == token)
            else {
                // The hub went away while the request was in flight.
                drop(request);
                return None;
            };

            if request.status() != Status::Success {
                warn!(
                    "Hub {} status change request failed: {:?}",
                    request.address(),
                    request.status()
                );
                extension.status_request = Some(request);
                return None;
            }

            let size = request.transferred().min(extension.changed.len());
            extension.changed[..size].copy_from_slice(&request.data()[..size]);
            extension.changed[size..].fill(0);
            extension.status_request = Some(request);

            let pending = self.pending.borrow(cs);
            pending.set(pending.get() | hub.bit());
            self.worker.borrow(cs).borrow().clone()
        });

        if let Some(semaphore) = semaphore {
            semaphore.signal();
            self.release(semaphore);
        }
    }

    /// Handle every change in the hub's bitmap, then listen again
    fn hub_process(&'static self, hub: HubId) {
        let mut changed = [0u8; MAX_BITMAP];
        let Some(size) = self.with_hub(hub, |extension| {
            let size = extension.changed.len().min(MAX_BITMAP);
            changed[..size].copy_from_slice(&extension.changed[..size]);
            size
        }) else {
            return;
        };

        for (index, byte) in changed[..size].iter().enumerate() {
            let mut bits = *byte;
            while bits != 0 {
                let bit = 7 - bits.leading_zeros();
                bits &= !(1 << bit);
                match index * 8 + bit as usize {
                    0 => self.hub_changed(hub),
                    port => self.hub_port_changed(hub, port as u8),
                }
            }
        }

        self.hub_resubmit(hub);
    }

    /// Submit the parked status change request
    pub(crate) fn hub_resubmit(&self, hub: HubId) {
        let request = self.with_hub_mut(hub, |extension| {
            let mut request = extension.status_request.take()?;
            if let Some(callback) = &extension.status_callback {
                request.set_callback(Arc::clone(callback));
            }
            Some(request)
        });
        match request {
            Some(Some(request)) => self.submit(request),
            Some(None) => {
                warn!("Hub {} has no status change request", hub.index());
            }
            None => {
                debug!("Hub {} went away before resubmission", hub.index());
            }
        }
    }

    fn hub_changed(&self, hub: HubId) {
        info!("Processing hub {} change", hub.index());
    }
}
