// Licensed under the Apache-2.0 license

//! Poll notification bitmask
//!
//! Firmware raises these through the notification word in its state block;
//! `poll` collects them into one value per interrupt.

/// Notification bits reported by one `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Notifications(u32);

impl Notifications {
    /// Response arrived on the host-to-MCU mailbox.
    pub const MAILBOX_IN: u32 = 1 << 0;
    /// Device-initiated message on the MCU-to-host mailbox.
    pub const MAILBOX_OUT: u32 = 1 << 1;
    /// Doorbell from the signal-processor channel.
    pub const DSP_MAILBOX: u32 = 1 << 2;
    /// Inference produced a match event.
    pub const MATCH: u32 = 1 << 3;
    /// A ring buffer crossed its fill threshold.
    pub const WATERMARK: u32 = 1 << 4;
    /// Extraction data is ready.
    pub const EXTRACT_READY: u32 = 1 << 5;
    /// Neural-network execution error.
    pub const DNN_ERROR: u32 = 1 << 6;
    /// Firmware-reported fault.
    pub const DEVICE_FAULT: u32 = 1 << 7;
    /// Feature-frame delivery.
    pub const FEATURE: u32 = 1 << 8;

    const ALL: u32 = Self::MAILBOX_IN
        | Self::MAILBOX_OUT
        | Self::DSP_MAILBOX
        | Self::MATCH
        | Self::WATERMARK
        | Self::EXTRACT_READY
        | Self::DNN_ERROR
        | Self::DEVICE_FAULT
        | Self::FEATURE;

    pub const fn empty() -> Self {
        Notifications(0)
    }

    /// Keeps only the bits this driver understands.
    pub const fn from_bits(bits: u32) -> Self {
        Notifications(bits & Self::ALL)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, bits: u32) {
        self.0 |= bits & Self::ALL;
    }

    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}
