// Licensed under the Apache-2.0 license

//! AON Bus Transport Layer
//!
//! Capability trait for the raw register/memory channel to an AON
//! coprocessor. The driver core consumes this through `&mut dyn
//! BusTransport`; platform integrations (SPI controller, emulator, test
//! mock) implement it.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod error;

pub use error::{BusError, BusResult};

/// The two logical address spaces behind the bus.
///
/// `Mcu` covers the control core's memory and the SPI-visible register
/// window; `Dsp` covers the signal processor's memory. Addresses do not
/// overlap between regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegion {
    Mcu,
    Dsp,
}

/// Raw transport capability to the coprocessor.
///
/// All transfers are byte-granular at 32-bit addresses; the transport has
/// no knowledge of the structures living at those addresses. `acquire` and
/// `release` bracket one logical driver operation so a multi-threaded
/// integration can serialize sessions; the driver never nests the bracket.
pub trait BusTransport {
    /// Read `buffer.len()` bytes starting at `address`.
    fn read(&mut self, region: MemoryRegion, address: u32, buffer: &mut [u8]) -> BusResult<()>;

    /// Write `buffer.len()` bytes starting at `address`.
    fn write(&mut self, region: MemoryRegion, address: u32, buffer: &[u8]) -> BusResult<()>;

    /// Take the mutual-exclusion bracket for one logical operation.
    fn acquire(&mut self) -> BusResult<()>;

    /// Return the mutual-exclusion bracket.
    fn release(&mut self) -> BusResult<()>;

    /// Block until the coprocessor raises its mailbox interrupt line, or
    /// the transport's own wait budget expires.
    fn wait_for_mailbox_signal(&mut self) -> BusResult<()>;

    /// Busy-wait or yield for at least `us` microseconds.
    fn sleep_microseconds(&mut self, us: u32);
}

/// Scoped hold of the bus bracket.
///
/// `acquire` on construction, `release` on drop, so every exit path out of
/// a driver entry point returns the bracket. A release failure on drop is
/// swallowed; the transport is expected to recover on the next acquire.
pub struct BusGuard<'a> {
    bus: &'a mut dyn BusTransport,
}

impl<'a> BusGuard<'a> {
    pub fn new(bus: &'a mut dyn BusTransport) -> BusResult<Self> {
        bus.acquire()?;
        Ok(Self { bus })
    }

    pub fn bus(&mut self) -> &mut dyn BusTransport {
        self.bus
    }
}

impl Drop for BusGuard<'_> {
    fn drop(&mut self) {
        let _ = self.bus.release();
    }
}

/// Convenience for single-word reads at word-aligned firmware addresses.
pub fn read_word(
    bus: &mut dyn BusTransport,
    region: MemoryRegion,
    address: u32,
) -> BusResult<u32> {
    let mut bytes = [0u8; 4];
    bus.read(region, address, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

/// Convenience for single-word writes at word-aligned firmware addresses.
pub fn write_word(
    bus: &mut dyn BusTransport,
    region: MemoryRegion,
    address: u32,
    value: u32,
) -> BusResult<()> {
    bus.write(region, address, &value.to_le_bytes())
}
