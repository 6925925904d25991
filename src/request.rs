//! Transfer requests
//!
//! A [`Request`] is the unit of work handed to the [`HostController`](crate::HostController).
//! The controller owns the request while it's in flight. When the transfer
//! ends, the controller calls [`complete()`](Request::complete), which hands
//! the request to its callback. Whoever holds the request after that frees
//! it by dropping it, or submits it again.

use crate::descriptor::TransferType;
use crate::device::{DeviceId, Speed};
use crate::setup::SetupPacket;
use crate::Status;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use usb_device::{
    control::{Recipient, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

/// Completion callback
///
/// Invoked exactly once per submission, from whatever context the controller
/// completes transfers in, including interrupt handlers.
pub type Callback = Arc<dyn Fn(Box<Request>) + Send + Sync>;

/// A non-default endpoint targeted by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub address: EndpointAddress,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// A transfer request
pub struct Request {
    device: Option<DeviceId>,
    address: u8,
    speed: Speed,
    max_packet_size: u16,
    endpoint: Option<Endpoint>,
    setup: SetupPacket,
    data: Vec<u8>,
    transferred: usize,
    status: Status,
    callback: Option<Callback>,
}

impl Request {
    /// Allocate a request with a zeroed, `size` byte data buffer
    ///
    /// Returns `None` if the buffer can't be allocated. The host calls this
    /// with interrupts masked.
    pub(crate) fn allocate(size: usize) -> Option<Box<Request>> {
        let mut data = Vec::new();
        data.try_reserve_exact(size).ok()?;
        data.resize(size, 0);
        Some(Box::new(Request {
            device: None,
            address: 0,
            speed: Speed::Full,
            max_packet_size: crate::DEFAULT_MAX_PACKET_SIZE,
            endpoint: None,
            setup: SetupPacket::new(
                UsbDirection::Out,
                RequestType::Standard,
                Recipient::Device,
                0,
                0,
                0,
            ),
            data,
            transferred: 0,
            status: Status::Unprocessed,
            callback: None,
        }))
    }

    /// Finish the transfer and hand the request to its callback
    ///
    /// Host controllers must call this exactly once per submission.
    /// `transferred` is clamped to the data buffer size. The callback is
    /// moved out of the request, so a resubmitted request needs a new one.
    ///
    /// [`Host::submit()`](crate::Host::submit) only accepts requests with a
    /// callback, so the request is never dropped here.
    pub fn complete(mut self: Box<Self>, status: Status, transferred: usize) {
        self.status = status;
        self.transferred = transferred.min(self.data.len());
        match self.callback.take() {
            Some(callback) => callback(self),
            None => {
                error!("Completed a request without a callback");
            }
        }
    }

    /// Mark the request as not yet processed
    pub(crate) fn reset(&mut self) {
        self.status = Status::Unprocessed;
        self.transferred = 0;
    }

    /// The device this request targets, if any
    pub fn device(&self) -> Option<DeviceId> {
        self.device
    }

    /// Bus address of the target; zero for the default address
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn speed(&self) -> Speed {
        self.speed
    }

    /// Maximum packet size of the target's default control pipe
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    pub(crate) fn set_target(
        &mut self,
        device: Option<DeviceId>,
        address: u8,
        speed: Speed,
        max_packet_size: u16,
    ) {
        self.device = device;
        self.address = address;
        self.speed = speed;
        self.max_packet_size = max_packet_size;
    }

    /// The endpoint this request targets, or `None` for the default
    /// control pipe
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub(crate) fn set_endpoint(&mut self, endpoint: Option<Endpoint>) {
        self.endpoint = endpoint;
    }

    /// The setup packet; only meaningful for control transfers
    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub(crate) fn set_setup(&mut self, setup: SetupPacket) {
        self.setup = setup;
    }

    /// Declared size of the data stage
    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The bytes received (IN) or sent (OUT) by the last completion
    pub fn transferred_data(&self) -> &[u8] {
        &self.data[..self.transferred]
    }

    pub fn transferred(&self) -> usize {
        self.transferred
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn set_callback(&mut self, callback: Callback) {
        self.callback = Some(callback);
    }

    pub fn callback(&self) -> Option<&Callback> {
        self.callback.as_ref()
    }
}
