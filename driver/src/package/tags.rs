// Licensed under the Apache-2.0 license

//! Package record tags and wire structs
//!
//! A package is a flat sequence of `{tag:u32, length:u32, value}` records,
//! all fields little-endian. The structs here mirror the value layouts of
//! the fixed-shape records; variable records carry their own headers,
//! also defined here. Capacity limits for every index or count embedded
//! in package data live next to the structs they bound.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Value of the magic record.
pub const MAGIC_VALUE: u32 = 0xa0ce_cafe;

/// Record tags. Unrecognized tags are a hard parse error, never a skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Tag {
    Magic = 0x01,
    /// Package-builder version marker, ignored.
    PackagerVersion = 0x02,
    InterfaceVersion = 0x03,
    PackageVersion = 0x04,
    FirmwareVersion = 0x05,
    DspFirmwareVersion = 0x06,
    Labels = 0x07,
    BoardCalibrationV1 = 0x08,
    BoardCalibrationV2 = 0x09,
    BoardCalibrationV3 = 0x0a,
    BoardCalibrationV4 = 0x0b,
    McuFirmware = 0x10,
    DspFirmware = 0x11,
    NnParameters = 0x12,
    McuFirmwareEncrypted = 0x13,
    DspFirmwareEncrypted = 0x14,
    NnParametersEncrypted = 0x15,
    NnMetadata = 0x20,
    OrchestratorGraph = 0x21,
    PosteriorV4 = 0x22,
    PosteriorV5 = 0x23,
    PosteriorV6 = 0x24,
    PosteriorV7 = 0x25,
    Softmax = 0x26,
    DnnPowerConfig = 0x27,
    FrontEndV3 = 0x30,
    PdmConfig = 0x31,
    I2sConfig = 0x32,
    MicSettings = 0x33,
    GainConfig = 0x34,
    SensorConfig = 0x38,
    PinMux = 0x39,
    DspFlowCollection = 0x40,
    DspAlgoParams = 0x41,
    AlgoAttach = 0x42,
    Checksum = 0x7f,
}

impl Tag {
    /// Exact value length for fixed-shape records; `None` for records
    /// whose length depends on embedded counts.
    pub fn fixed_len(self) -> Option<u32> {
        let len = match self {
            Tag::Magic => 4,
            Tag::InterfaceVersion => core::mem::size_of::<InterfaceVersion>(),
            Tag::BoardCalibrationV1 => 16,
            Tag::BoardCalibrationV2 => 32,
            Tag::BoardCalibrationV3 => 64,
            Tag::BoardCalibrationV4 => 80,
            Tag::Softmax => core::mem::size_of::<SoftmaxConfig>(),
            Tag::DnnPowerConfig => core::mem::size_of::<DnnPowerConfig>(),
            Tag::PdmConfig => core::mem::size_of::<PdmConfig>(),
            Tag::I2sConfig => core::mem::size_of::<I2sConfig>(),
            Tag::MicSettings => core::mem::size_of::<MicSettings>(),
            Tag::GainConfig => core::mem::size_of::<GainConfig>(),
            Tag::PinMux => core::mem::size_of::<PinMuxConfig>(),
            Tag::AlgoAttach => core::mem::size_of::<AlgoAttach>(),
            Tag::Checksum => 4,
            _ => return None,
        };
        Some(len as u32)
    }
}

/// Outer record header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TlvHeader {
    pub tag: u32,
    pub length: u32,
}

pub const TLV_HEADER_LEN: usize = core::mem::size_of::<TlvHeader>();

/// Package binary-interface identity.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct InterfaceVersion {
    /// Chip-type code, see `chip::ChipType`.
    pub chip_type: u32,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Version/label string capacity in the scratch region.
pub const STRING_CAP: usize = 128;
pub const LABELS_CAP: usize = 1024;

// ---------------------------------------------------------------------------
// Neural-network metadata
// ---------------------------------------------------------------------------

pub const MAX_NETWORKS: usize = 4;
pub const MAX_LAYERS: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NnMetadataHeader {
    pub network_count: u32,
}

/// Per-network base metadata; `cached` selects whether each layer carries
/// cache instructions.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NnNetworkMeta {
    pub layer_count: u32,
    pub cached: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NnLayerCoords {
    pub input_coord: u32,
    pub output_coord: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NnCacheInstructions {
    pub inst: [u32; 4],
}

// ---------------------------------------------------------------------------
// Orchestrator graph
// ---------------------------------------------------------------------------

pub const MAX_GRAPH_NODES: u32 = 16;
pub const GRAPH_NODE_FANOUT: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GraphHeader {
    /// Initially enabled flow sets.
    pub flow_bitmap: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GraphNode {
    pub id: u8,
    pub flow_set: u8,
    pub status: u8,
    pub action: u8,
    pub num_inputs: u8,
    pub num_outputs: u8,
    pub unused: [u8; 2],
    pub inputs: [u8; GRAPH_NODE_FANOUT],
    pub outputs: [u8; GRAPH_NODE_FANOUT],
}

// ---------------------------------------------------------------------------
// Posterior handler
// ---------------------------------------------------------------------------

pub const MAX_STATES: u32 = 8;
pub const MAX_CLASSES: u32 = 32;

/// Common posterior header; version-specific extra header bytes follow it.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PosteriorHeader {
    pub num_states: u32,
    pub num_classes: u32,
}

/// Per-version record geometry: extra header bytes after
/// [`PosteriorHeader`], then per-state and per-class record sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosteriorShape {
    pub tag: Tag,
    pub version: u32,
    pub extra_header: u32,
    pub state_len: u32,
    pub class_len: u32,
}

impl PosteriorShape {
    pub fn for_tag(tag: Tag) -> Option<PosteriorShape> {
        match tag {
            Tag::PosteriorV4 => Some(PosteriorShape {
                tag,
                version: 4,
                extra_header: 4,
                state_len: 12,
                class_len: 16,
            }),
            Tag::PosteriorV5 => Some(PosteriorShape {
                tag,
                version: 5,
                extra_header: 4,
                state_len: 12,
                class_len: 20,
            }),
            Tag::PosteriorV6 => Some(PosteriorShape {
                tag,
                version: 6,
                extra_header: 4,
                state_len: 16,
                class_len: 20,
            }),
            Tag::PosteriorV7 => Some(PosteriorShape {
                tag,
                version: 7,
                extra_header: 12,
                state_len: 16,
                class_len: 20,
            }),
            _ => None,
        }
    }

    /// Declared length a record with these counts must have.
    pub fn expected_len(&self, num_states: u32, num_classes: u32) -> u32 {
        core::mem::size_of::<PosteriorHeader>() as u32
            + self.extra_header
            + num_states * self.state_len
            + num_states * num_classes * self.class_len
    }
}

// ---------------------------------------------------------------------------
// Audio front end
// ---------------------------------------------------------------------------

pub const MAX_FILTERS: u32 = 40;
/// Boundary entries handed to the sink per parser step.
pub const BOUNDARY_SLICE: usize = 10;

/// Filter-bank front-end header. The boundary table that follows has
/// `filter_count + 1` u16 entries plus two pad bytes when `filter_count`
/// is even.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrontEndHeader {
    pub filter_count: u32,
    pub sample_rate: u32,
    pub power_offset: u32,
}

impl FrontEndHeader {
    pub fn boundary_entries(&self) -> u32 {
        self.filter_count + 1
    }

    pub fn pad_bytes(&self) -> u32 {
        if self.filter_count % 2 == 0 {
            2
        } else {
            0
        }
    }
}

// ---------------------------------------------------------------------------
// Fixed-shape configuration records
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SoftmaxConfig {
    pub network_id: u32,
    pub scale: u32,
    pub zero_point: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DnnPowerConfig {
    pub clock_divide: u32,
    pub power_mode: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PdmConfig {
    pub sample_rate: u32,
    pub pdm_rate: u32,
    pub clock_mode: u32,
    pub mic_count: u32,
    pub decimation: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct I2sConfig {
    pub sample_rate: u32,
    pub frame_size: u32,
    pub mode: u32,
    pub edge: u32,
    pub delay: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct MicSettings {
    pub mic0_gain: u32,
    pub mic1_gain: u32,
    pub dc_offset: u32,
    pub agc: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct GainConfig {
    pub digital_gain: u32,
    pub analog_gain: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PinMuxConfig {
    pub function_select: u32,
    pub pull_config: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct AlgoAttach {
    pub algo_id: u32,
    pub input_flow: u32,
    pub output_flow: u32,
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

pub const MAX_SENSORS: usize = 4;
pub const SENSOR_GPIO_ROLES: usize = 8;
pub const SENSOR_PARAM_BYTES: usize = 16;

/// One sensor configuration record, stored verbatim in the scratch region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SensorRecord {
    pub id: u32,
    /// 0 = none, 1 = I2C, 2 = SPI target.
    pub interface: u8,
    pub interface_address: u8,
    pub unused: [u8; 2],
    pub gpio_roles: [u8; SENSOR_GPIO_ROLES],
    pub axis_enable: u32,
    pub axis_invert: u32,
    pub parameters: [u8; SENSOR_PARAM_BYTES],
}

pub const SENSOR_RECORD_LEN: usize = core::mem::size_of::<SensorRecord>();

// ---------------------------------------------------------------------------
// DSP flow collection
// ---------------------------------------------------------------------------

pub const MAX_FLOW_RULES: u32 = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FlowRule {
    pub set_id: u8,
    pub src_type: u8,
    pub src_param: u8,
    pub dst_type: u8,
    pub dst_param: u8,
    pub algo_index: u8,
    pub unused: [u8; 2],
}

// ---------------------------------------------------------------------------
// Multi-segment payloads
// ---------------------------------------------------------------------------

/// Micro-record header inside multi-segment payloads; `length` bytes for
/// `address` follow immediately.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentHeader {
    pub address: u32,
    pub length: u32,
}

pub const SEGMENT_HEADER_LEN: usize = core::mem::size_of::<SegmentHeader>();
