// Licensed under the Apache-2.0 license

//! Persistent scratch region
//!
//! A 2048-byte area of control-core RAM that survives host restarts for
//! as long as the device stays powered. The driver caches package-derived
//! state there (identity, version strings, labels, sensor records) so a
//! host that reattaches to an already-running device can recover it
//! without reloading anything.
//!
//! Region layout, all fields little-endian:
//!
//! | offset | field                                |
//! |--------|--------------------------------------|
//! | 0      | CRC-32 over bytes 4..2048            |
//! | 4      | valid-field bitmask                  |
//! | 8      | chip-type code                       |
//! | 12     | interface version major/minor/patch  |
//! | 24     | clock preset index                   |
//! | 28     | heartbeat interval, milliseconds     |
//! | 32     | firmware version string slot         |
//! | 164    | DSP firmware version string slot     |
//! | 296    | package version string slot          |
//! | 428    | label strings slot                   |
//! | 1456   | sensor records, 4 x 40 bytes         |
//!
//! A CRC mismatch on a cold read means no firmware has populated the
//! region yet and every field reads as absent. A mismatch on a read-back
//! of the driver's own write is real corruption and surfaces as an error.

use crate::error::{Error, Result};
use crate::package::{InterfaceVersion, SensorRecord, StringKind, MAX_SENSORS, SENSOR_RECORD_LEN};
use aoncore_bus::{BusTransport, MemoryRegion};
use crc::{Crc, CRC_32_ISO_HDLC};
use zerocopy::{FromBytes, IntoBytes};

pub const SCRATCH_LEN: usize = 2048;

const REGION_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const CRC_WORD: usize = 0;
const VALID_WORD: usize = 4;
const CHIP_TYPE: usize = 8;
const VERSION_MAJOR: usize = 12;
const VERSION_MINOR: usize = 16;
const VERSION_PATCH: usize = 20;
const CLOCK_PRESET: usize = 24;
const HEARTBEAT_MS: usize = 28;
const FW_VERSION: usize = 32;
const DSP_VERSION: usize = 164;
const PKG_VERSION: usize = 296;
const LABELS: usize = 428;
const SENSORS: usize = 1456;

/// Capacity of each version string slot, excluding its length word.
pub const VERSION_CAP: usize = 128;
/// Capacity of the label slot, excluding its length word.
pub const LABELS_AREA: usize = 1024;

const VALID_IDENTITY: u32 = 1 << 0;
const VALID_CLOCK: u32 = 1 << 1;
const VALID_HEARTBEAT: u32 = 1 << 2;
const VALID_FW_VERSION: u32 = 1 << 3;
const VALID_DSP_VERSION: u32 = 1 << 4;
const VALID_PKG_VERSION: u32 = 1 << 5;
const VALID_LABELS: u32 = 1 << 6;
const VALID_SENSORS: u32 = 1 << 7;

/// Host-side shadow of the device scratch region.
pub struct ScratchRegion {
    origin: u32,
    shadow: [u8; SCRATCH_LEN],
    /// Last device read carried a valid CRC.
    populated: bool,
}

impl ScratchRegion {
    pub fn new(origin: u32) -> Self {
        ScratchRegion {
            origin,
            shadow: [0; SCRATCH_LEN],
            populated: false,
        }
    }

    /// Pull the device image into the shadow. An invalid CRC is not an
    /// error here; the shadow just starts out empty.
    pub fn refresh(&mut self, bus: &mut dyn BusTransport) -> Result<()> {
        bus.read(MemoryRegion::Mcu, self.origin, &mut self.shadow)?;
        let stored = self.word(CRC_WORD);
        let computed = REGION_CRC.checksum(&self.shadow[VALID_WORD..]);
        self.populated = stored == computed;
        if !self.populated {
            log::debug!(
                "scratch at 0x{:08x} has no valid image (stored 0x{:08x}, computed 0x{:08x})",
                self.origin,
                stored,
                computed
            );
            self.shadow = [0; SCRATCH_LEN];
        }
        Ok(())
    }

    /// Re-read the region the driver itself wrote. Here an invalid CRC
    /// is corruption, not absence.
    pub fn verify(&mut self, bus: &mut dyn BusTransport) -> Result<()> {
        self.refresh(bus)?;
        if !self.populated {
            return Err(Error::ChecksumMismatch);
        }
        Ok(())
    }

    /// Seal the shadow with a fresh CRC and write it back to the device.
    pub fn flush(&mut self, bus: &mut dyn BusTransport) -> Result<()> {
        let crc = REGION_CRC.checksum(&self.shadow[VALID_WORD..]);
        self.set_word(CRC_WORD, crc);
        bus.write(MemoryRegion::Mcu, self.origin, &self.shadow)?;
        self.populated = true;
        Ok(())
    }

    /// Drop every cached field. The device copy is untouched until the
    /// next `flush`.
    pub fn clear(&mut self) {
        self.shadow = [0; SCRATCH_LEN];
        self.populated = false;
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    pub fn identity(&self) -> Option<InterfaceVersion> {
        if !self.flag(VALID_IDENTITY) {
            return None;
        }
        Some(InterfaceVersion {
            chip_type: self.word(CHIP_TYPE),
            major: self.word(VERSION_MAJOR),
            minor: self.word(VERSION_MINOR),
            patch: self.word(VERSION_PATCH),
        })
    }

    pub fn set_identity(&mut self, identity: &InterfaceVersion) {
        self.set_word(CHIP_TYPE, identity.chip_type);
        self.set_word(VERSION_MAJOR, identity.major);
        self.set_word(VERSION_MINOR, identity.minor);
        self.set_word(VERSION_PATCH, identity.patch);
        self.mark(VALID_IDENTITY);
    }

    pub fn clock_preset(&self) -> Option<u32> {
        self.flag(VALID_CLOCK).then(|| self.word(CLOCK_PRESET))
    }

    pub fn set_clock_preset(&mut self, preset: u32) {
        self.set_word(CLOCK_PRESET, preset);
        self.mark(VALID_CLOCK);
    }

    pub fn heartbeat_interval_ms(&self) -> Option<u32> {
        self.flag(VALID_HEARTBEAT).then(|| self.word(HEARTBEAT_MS))
    }

    pub fn set_heartbeat_interval_ms(&mut self, interval: u32) {
        self.set_word(HEARTBEAT_MS, interval);
        self.mark(VALID_HEARTBEAT);
    }

    pub fn version(&self, kind: StringKind) -> Option<&str> {
        let (offset, bit) = Self::version_slot(kind);
        self.string_slot(offset, VERSION_CAP, bit)
    }

    pub fn set_version(&mut self, kind: StringKind, text: &[u8]) -> Result<()> {
        let (offset, bit) = Self::version_slot(kind);
        self.set_string_slot(offset, VERSION_CAP, bit, text)
    }

    /// Iterate the cached class labels in class-index order. Empty when
    /// no labels are cached.
    pub fn labels(&self) -> LabelIter<'_> {
        let bytes = if self.flag(VALID_LABELS) {
            let len = (self.word(LABELS) as usize).min(LABELS_AREA);
            &self.shadow[LABELS + 4..LABELS + 4 + len]
        } else {
            &[]
        };
        LabelIter { rest: bytes }
    }

    /// Label for one class index.
    pub fn label(&self, index: u32) -> Option<&str> {
        self.labels().nth(index as usize)
    }

    pub fn set_labels(&mut self, packed: &[u8]) -> Result<()> {
        self.set_string_slot(LABELS, LABELS_AREA, VALID_LABELS, packed)
    }

    pub fn sensor(&self, slot: usize) -> Option<SensorRecord> {
        if slot >= MAX_SENSORS || !self.flag(VALID_SENSORS) {
            return None;
        }
        let offset = SENSORS + slot * SENSOR_RECORD_LEN;
        SensorRecord::read_from_bytes(&self.shadow[offset..offset + SENSOR_RECORD_LEN]).ok()
    }

    pub fn set_sensor(&mut self, slot: usize, record: &SensorRecord) -> Result<()> {
        if slot >= MAX_SENSORS {
            return Err(Error::Unsupported);
        }
        let offset = SENSORS + slot * SENSOR_RECORD_LEN;
        self.shadow[offset..offset + SENSOR_RECORD_LEN].copy_from_slice(record.as_bytes());
        self.mark(VALID_SENSORS);
        Ok(())
    }

    fn version_slot(kind: StringKind) -> (usize, u32) {
        match kind {
            StringKind::Firmware => (FW_VERSION, VALID_FW_VERSION),
            StringKind::DspFirmware => (DSP_VERSION, VALID_DSP_VERSION),
            StringKind::Package => (PKG_VERSION, VALID_PKG_VERSION),
        }
    }

    fn string_slot(&self, offset: usize, cap: usize, bit: u32) -> Option<&str> {
        if !self.flag(bit) {
            return None;
        }
        let len = (self.word(offset) as usize).min(cap);
        core::str::from_utf8(&self.shadow[offset + 4..offset + 4 + len]).ok()
    }

    fn set_string_slot(&mut self, offset: usize, cap: usize, bit: u32, text: &[u8]) -> Result<()> {
        if text.len() > cap {
            return Err(Error::Unsupported);
        }
        self.set_word(offset, text.len() as u32);
        self.shadow[offset + 4..offset + 4 + text.len()].copy_from_slice(text);
        self.shadow[offset + 4 + text.len()..offset + 4 + cap].fill(0);
        self.mark(bit);
        Ok(())
    }

    fn flag(&self, bit: u32) -> bool {
        self.word(VALID_WORD) & bit != 0
    }

    fn mark(&mut self, bit: u32) {
        let valid = self.word(VALID_WORD) | bit;
        self.set_word(VALID_WORD, valid);
    }

    fn word(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.shadow[offset],
            self.shadow[offset + 1],
            self.shadow[offset + 2],
            self.shadow[offset + 3],
        ])
    }

    fn set_word(&mut self, offset: usize, value: u32) {
        self.shadow[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// Iterator over NUL-separated label strings.
pub struct LabelIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for LabelIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while !self.rest.is_empty() {
            let end = self
                .rest
                .iter()
                .position(|b| *b == 0)
                .unwrap_or(self.rest.len());
            let (label, rest) = self.rest.split_at(end);
            self.rest = rest.get(1..).unwrap_or(&[]);
            if let Ok(text) = core::str::from_utf8(label) {
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
        None
    }
}
