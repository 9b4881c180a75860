// Licensed under the Apache-2.0 license

//! Bus transport error types

use core::fmt;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// Transfer failed at the physical layer
    Io,

    /// Address or length outside the addressable window
    OutOfRange,

    /// Mutual-exclusion bracket unavailable
    Contended,

    /// No mailbox signal within the transport's wait budget
    SignalTimeout,

    /// Platform-specific failure code
    Platform(i32),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Io => write!(f, "Bus transfer failed"),
            BusError::OutOfRange => write!(f, "Address out of range"),
            BusError::Contended => write!(f, "Bus bracket contended"),
            BusError::SignalTimeout => write!(f, "No mailbox signal"),
            BusError::Platform(code) => write!(f, "Platform error: {}", code),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BusError {}
