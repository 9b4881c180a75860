// Licensed under the Apache-2.0 license

//! Driver error types
//!
//! One error enum for the whole driver core. Nothing here is recovered
//! internally; every kind propagates to the caller of the session entry
//! point that hit it. The only in-driver retry is the mailbox handshake
//! budget in `mailbox.rs`.

use aoncore_bus::BusError;
use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Operation needs firmware state addresses that have not been
    /// discovered yet
    Uninitialized,

    /// Mailbox response sequence bit did not match the expected toggle
    ProtocolSequence,

    /// Mailbox wait exceeded its budget
    Timeout,

    /// Coprocessor echoed an explicit failure code
    DeviceReported(u32),

    /// Package record inconsistent with its expected payload shape.
    /// `tag` is the offending record; `index` is the handler sub-state
    /// (layer, network, node, or slice number) where the mismatch surfaced.
    MalformedInput { tag: u32, index: u32 },

    /// Package record tag not recognized
    UnknownTag(u32),

    /// Stored CRC disagrees with the recomputed one
    ChecksumMismatch,

    /// Operation invalid for the probed chip or its secure/locked mode
    Unsupported,

    /// No new data available; retry after the producer advances
    Exhausted,

    /// Underlying bus transport failure
    Bus(BusError),
}

impl Error {
    /// Malformed-record constructor for sites without a sub-state index.
    pub fn malformed(tag: u32) -> Self {
        Error::MalformedInput { tag, index: 0 }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Uninitialized => write!(f, "Device not initialized"),
            Error::ProtocolSequence => write!(f, "Mailbox sequence mismatch"),
            Error::Timeout => write!(f, "Mailbox wait timed out"),
            Error::DeviceReported(code) => write!(f, "Device reported error 0x{:02x}", code),
            Error::MalformedInput { tag, index } => {
                write!(f, "Malformed package record (tag 0x{:02x}", tag)?;
                if *index != 0 {
                    write!(f, ", item {}", index)?;
                }
                write!(f, ")")
            }
            Error::UnknownTag(tag) => write!(f, "Unknown package tag 0x{:02x}", tag),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Unsupported => write!(f, "Operation not supported"),
            Error::Exhausted => write!(f, "No data available"),
            Error::Bus(err) => write!(f, "Bus error: {}", err),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl From<BusError> for Error {
    fn from(err: BusError) -> Self {
        match err {
            // The transport's own signal wait and the driver's poll budget
            // surface the same way to callers.
            BusError::SignalTimeout => Error::Timeout,
            other => Error::Bus(other),
        }
    }
}
