// Licensed under the Apache-2.0 license

//! Chip variant capabilities
//!
//! The AON family shares one protocol but not one memory map. Everything
//! that differs between variants (scratch origin, exchange area, load
//! windows, pinout width) is expressed through the [`ChipVariant`] trait;
//! the session picks one implementation at probe time and never branches
//! on a family code again.

use crate::error::{Error, Result};
use aoncore_bus::{BusTransport, MemoryRegion};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Device-id register, low byte significant.
pub const DEVICE_ID_ADDR: u32 = 0x4000_0008;

/// Chip-type code carried in the package identity record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ChipType {
    /// Legacy part, not supported by this driver.
    Aon110 = 1,
    Aon115 = 2,
    Aon210 = 3,
    Aon240 = 4,
}

/// A contiguous address range in one bus region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressWindow {
    pub region: MemoryRegion,
    pub base: u32,
    pub len: u32,
}

impl AddressWindow {
    pub const fn end(&self) -> u32 {
        self.base + self.len
    }

    pub const fn contains(&self, address: u32, len: u32) -> bool {
        address >= self.base && address + len <= self.end()
    }
}

/// Per-variant address layout and capability limits.
///
/// Implementations are stateless unit structs; the session stores a
/// `&'static dyn ChipVariant` chosen by [`probe`].
pub trait ChipVariant {
    fn chip_type(&self) -> ChipType;

    fn name(&self) -> &'static str;

    /// True if the 8-bit device-id register value belongs to this variant.
    fn matches_device_id(&self, id: u8) -> bool;

    /// Origin of the 2048-byte persisted scratch region in MCU RAM.
    fn scratch_origin(&self) -> u32;

    /// Origin of the 16-byte extended-op exchange area.
    fn exchange_origin(&self) -> u32;

    /// Open RAM window used by the secure-mode bootloader handshake.
    fn open_ram(&self) -> AddressWindow;

    /// Load window for the control-MCU firmware image.
    fn mcu_fw_window(&self) -> AddressWindow;

    /// Load window for the signal-processor firmware image.
    fn dsp_fw_window(&self) -> AddressWindow;

    /// Sensor config slots the firmware accepts.
    fn sensor_slots(&self) -> usize;

    /// GPIO pins available for sensor role assignment.
    fn gpio_count(&self) -> u8;
}

/// Baseline variant.
pub struct Aon210;

/// Reduced-pinout variant; smaller RAM, so the scratch region and
/// exchange area sit lower.
pub struct Aon115;

/// AON210 memory map with the wider sensor table.
pub struct Aon240;

impl ChipVariant for Aon210 {
    fn chip_type(&self) -> ChipType {
        ChipType::Aon210
    }

    fn name(&self) -> &'static str {
        "AON210"
    }

    fn matches_device_id(&self, id: u8) -> bool {
        (0x30..=0x3f).contains(&id)
    }

    fn scratch_origin(&self) -> u32 {
        0x2003_f800
    }

    fn exchange_origin(&self) -> u32 {
        0x2003_f7f0
    }

    fn open_ram(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Mcu,
            base: 0x2000_0000,
            len: 0x800,
        }
    }

    fn mcu_fw_window(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Mcu,
            base: 0x2000_1000,
            len: 0x1_8000,
        }
    }

    fn dsp_fw_window(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Dsp,
            base: 0x3000_0000,
            len: 0x2_0000,
        }
    }

    fn sensor_slots(&self) -> usize {
        2
    }

    fn gpio_count(&self) -> u8 {
        16
    }
}

impl ChipVariant for Aon115 {
    fn chip_type(&self) -> ChipType {
        ChipType::Aon115
    }

    fn name(&self) -> &'static str {
        "AON115"
    }

    fn matches_device_id(&self, id: u8) -> bool {
        (0x48..=0x4b).contains(&id)
    }

    fn scratch_origin(&self) -> u32 {
        0x2001_f800
    }

    fn exchange_origin(&self) -> u32 {
        0x2001_f7f0
    }

    fn open_ram(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Mcu,
            base: 0x2000_0000,
            len: 0x800,
        }
    }

    fn mcu_fw_window(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Mcu,
            base: 0x2000_1000,
            len: 0x1_0000,
        }
    }

    fn dsp_fw_window(&self) -> AddressWindow {
        AddressWindow {
            region: MemoryRegion::Dsp,
            base: 0x3000_0000,
            len: 0x1_0000,
        }
    }

    fn sensor_slots(&self) -> usize {
        2
    }

    fn gpio_count(&self) -> u8 {
        8
    }
}

impl ChipVariant for Aon240 {
    fn chip_type(&self) -> ChipType {
        ChipType::Aon240
    }

    fn name(&self) -> &'static str {
        "AON240"
    }

    fn matches_device_id(&self, id: u8) -> bool {
        (0x40..=0x43).contains(&id)
    }

    fn scratch_origin(&self) -> u32 {
        Aon210.scratch_origin()
    }

    fn exchange_origin(&self) -> u32 {
        Aon210.exchange_origin()
    }

    fn open_ram(&self) -> AddressWindow {
        Aon210.open_ram()
    }

    fn mcu_fw_window(&self) -> AddressWindow {
        Aon210.mcu_fw_window()
    }

    fn dsp_fw_window(&self) -> AddressWindow {
        Aon210.dsp_fw_window()
    }

    fn sensor_slots(&self) -> usize {
        4
    }

    fn gpio_count(&self) -> u8 {
        16
    }
}

const VARIANTS: [&dyn ChipVariant; 3] = [&Aon210, &Aon115, &Aon240];

/// Map a raw device-id byte to its variant, if any.
pub fn variant_for_device_id(id: u8) -> Option<&'static dyn ChipVariant> {
    VARIANTS.into_iter().find(|v| v.matches_device_id(id))
}

/// Read the device-id register and resolve the chip variant.
pub fn probe(bus: &mut dyn BusTransport) -> Result<&'static dyn ChipVariant> {
    let mut id = [0u8; 1];
    bus.read(MemoryRegion::Mcu, DEVICE_ID_ADDR, &mut id)?;
    match variant_for_device_id(id[0]) {
        Some(variant) => {
            log::debug!("device id 0x{:02x} is {}", id[0], variant.name());
            Ok(variant)
        }
        None => {
            log::warn!("unrecognized device id 0x{:02x}", id[0]);
            Err(Error::Unsupported)
        }
    }
}
