//! Logging interface, contingent on the `log` feature
//!
//! The host core reports every state transition and failure as a
//! diagnostic line. Disable the `log` feature when your logger shares
//! a bus with the USB stack, or when you need the smallest image.

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        ::log::trace!($($args)*)
    };
}

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        ::log::debug!($($args)*)
    };
}

macro_rules! info {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        ::log::info!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        ::log::warn!($($args)*)
    };
}

macro_rules! error {
    ($($args:tt)*) => {
        #[cfg(feature = "log")]
        ::log::error!($($args)*)
    };
}
