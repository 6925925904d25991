//! Transfer status and host errors

/// The outcome of a transfer, as reported by the host controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The request hasn't completed since its last submission.
    Unprocessed,
    Success,
    /// The device responded with a STALL handshake.
    Stall,
    /// The device didn't respond in time.
    Timeout,
    /// The controller can't perform this kind of transfer.
    NotSupported,
    /// Any other bus or controller error.
    Failed,
}

impl Status {
    /// Convert the status into a `Result`
    ///
    /// Protocol statuses pass through verbatim. A request that never
    /// completed maps to [`Error::Failed`].
    pub fn into_result(self) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::Stall => Err(Error::Stall),
            Status::Timeout => Err(Error::Timeout),
            Status::NotSupported => Err(Error::NotSupported),
            Status::Unprocessed | Status::Failed => Err(Error::Failed),
        }
    }
}

/// Host errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A device or hub table, the allocator, or a kernel resource
    /// (semaphore, thread) is exhausted.
    Exhausted,
    /// The transfer stalled.
    Stall,
    /// The transfer, or a bounded wait, timed out.
    Timeout,
    /// The device or request isn't supported by this driver.
    NotSupported,
    /// Generic transfer failure.
    Failed,
    /// A descriptor failed validation.
    InvalidDescriptor,
    /// The device is already bound to a hub extension.
    AlreadyBound,
}

pub type Result<T> = core::result::Result<T, Error>;
