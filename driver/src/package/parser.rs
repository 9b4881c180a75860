// Licensed under the Apache-2.0 license

//! Incremental package parser
//!
//! Decodes the `{tag, length, value}` record stream and turns it into a
//! sequence of commit events on a [`PackageSink`]. The caller delivers
//! the package in chunks of any size, one byte included; all suspended
//! state lives in the parser, so the event sequence is identical for
//! every chunking of the same bytes.
//!
//! The declared length field is the sole authority for a record's extent.
//! Every count, index, and size embedded in a value is checked against
//! its capacity limit before anything is committed; a record whose
//! declared length disagrees with its expected payload shape fails before
//! the first commit for that record. Unknown tags are a hard error.
//!
//! Destination address checks for image and segment payloads are the
//! sink's responsibility; the parser validates only the stream itself.

use super::reader::{ChunkReader, Feed, VALUE_SCRATCH};
use super::tags::*;
use crate::error::{Error, Result};
use zerocopy::FromBytes;

/// Which image a load-bearing payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    McuFirmware,
    DspFirmware,
    NnParameters,
    DspAlgo,
}

/// Which cached string a version record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    Firmware,
    DspFirmware,
    Package,
}

/// One decoded commit. Borrowed payloads are only valid for the duration
/// of the `commit` call.
#[derive(Debug, Clone, Copy)]
pub enum PackageEvent<'a> {
    Identity(InterfaceVersion),
    VersionString {
        kind: StringKind,
        bytes: &'a [u8],
    },
    Labels {
        bytes: &'a [u8],
    },
    /// Fixed-shape record delivered verbatim.
    ConfigRecord {
        tag: Tag,
        bytes: &'a [u8],
    },
    ImageBegin {
        kind: ImageKind,
        total: u32,
    },
    ImageChunk {
        kind: ImageKind,
        offset: u32,
        bytes: &'a [u8],
    },
    SegmentChunk {
        kind: ImageKind,
        address: u32,
        bytes: &'a [u8],
    },
    ImageEnd {
        kind: ImageKind,
    },
    NetworkCount(u32),
    NetworkMeta {
        network: u32,
        meta: NnNetworkMeta,
    },
    LayerInputSize {
        network: u32,
        layer: u32,
        size: u32,
    },
    LayerCoords {
        network: u32,
        layer: u32,
        coords: NnLayerCoords,
    },
    LayerCache {
        network: u32,
        layer: u32,
        inst: NnCacheInstructions,
    },
    GraphNode {
        index: u32,
        node: GraphNode,
    },
    GraphApply {
        nodes: u32,
        flow_bitmap: u32,
    },
    PosteriorBegin {
        shape: PosteriorShape,
        num_states: u32,
        num_classes: u32,
        extra: &'a [u8],
    },
    PosteriorState {
        tag: Tag,
        state: u32,
        bytes: &'a [u8],
    },
    PosteriorClass {
        tag: Tag,
        state: u32,
        class: u32,
        bytes: &'a [u8],
    },
    FrontEndBegin(FrontEndHeader),
    FrontEndBoundaries {
        offset: u32,
        entries: &'a [u16],
    },
    SensorRecord {
        index: u32,
        record: SensorRecord,
    },
    FlowRule {
        index: u32,
        rule: FlowRule,
    },
    FlowApply {
        rules: u32,
    },
}

/// Consumer of decoded package content. The device-backed implementation
/// lives in `load`; tests use recording sinks.
pub trait PackageSink {
    fn commit(&mut self, event: PackageEvent<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct RecordContext {
    tag: Tag,
    raw_tag: u32,
    length: u32,
    consumed: u32,
}

impl RecordContext {
    fn remaining(&self) -> u32 {
        self.length - self.consumed
    }

    fn malformed(&self, index: u32) -> Error {
        Error::MalformedInput {
            tag: self.raw_tag,
            index,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NnPhase {
    Count,
    NetworkMeta,
    LayerInput,
    LayerCoords,
    LayerCache,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct NnMetadataState {
    phase: NnPhase,
    network_count: u32,
    network: u32,
    layer_count: u32,
    cached: bool,
    layer: u32,
}

#[derive(Debug, Clone, Copy)]
struct GraphState {
    header_done: bool,
    flow_bitmap: u32,
    nodes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PosteriorPhase {
    Counts,
    Extra,
    State,
    Class,
}

#[derive(Debug, Clone, Copy)]
struct PosteriorProgress {
    shape: PosteriorShape,
    phase: PosteriorPhase,
    num_states: u32,
    num_classes: u32,
    state: u32,
    class: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrontEndPhase {
    Header,
    Boundaries,
    Pad,
}

#[derive(Debug, Clone, Copy)]
struct FrontEndState {
    phase: FrontEndPhase,
    entries: u32,
    delivered: u32,
    pad: u32,
}

#[derive(Debug, Clone, Copy)]
struct SegmentProgress {
    kind: ImageKind,
    begun: bool,
    /// Destination of the next span; `remaining == 0` means the next
    /// bytes are a micro-header.
    address: u32,
    remaining: u32,
}

/// Per-record continuation. Each family owns its own state rather than
/// sharing one blob, so a handler can be exercised in isolation.
#[derive(Debug, Clone, Copy)]
enum Handler {
    Magic,
    Discard,
    Checksum {
        expected: u32,
    },
    Identity,
    VersionString {
        kind: StringKind,
    },
    Labels,
    ConfigRecord,
    Image {
        kind: ImageKind,
        begun: bool,
        delivered: u32,
    },
    Segments(SegmentProgress),
    NnMetadata(NnMetadataState),
    Graph(GraphState),
    Posterior(PosteriorProgress),
    FrontEnd(FrontEndState),
    Sensors {
        index: u32,
    },
    Flow {
        rules: u32,
    },
}

enum ParserState {
    /// Between records, gathering the next 8-byte header.
    Header,
    Value {
        record: RecordContext,
        handler: Handler,
    },
}

enum Step {
    Progress,
    NeedMore,
    RecordDone,
}

/// The resumable package decoder. One per load session; `reset` before
/// starting a new package.
pub struct PackageParser {
    reader: ChunkReader,
    state: ParserState,
    records: u32,
}

impl PackageParser {
    pub fn new() -> Self {
        PackageParser {
            reader: ChunkReader::new(),
            state: ParserState::Header,
            records: 0,
        }
    }

    pub fn reset(&mut self) {
        self.reader.reset();
        self.state = ParserState::Header;
        self.records = 0;
    }

    /// Records fully consumed so far.
    pub fn records_completed(&self) -> u32 {
        self.records
    }

    /// Absolute package offset of the next byte the parser expects.
    pub fn offset(&self) -> u64 {
        self.reader.offset()
    }

    /// Consume one chunk completely, committing everything it completes.
    pub fn feed(&mut self, sink: &mut dyn PackageSink, chunk: &[u8]) -> Result<()> {
        let PackageParser {
            reader,
            state,
            records,
        } = self;
        let mut feed = reader.feed(chunk);
        loop {
            match Self::step(state, &mut feed, sink)? {
                Step::Progress => {}
                Step::NeedMore => return Ok(()),
                Step::RecordDone => {
                    *records += 1;
                    *state = ParserState::Header;
                }
            }
        }
    }

    /// End of package. Fails if the stream stopped inside a record or a
    /// partial header.
    pub fn finish(&self) -> Result<()> {
        match &self.state {
            ParserState::Value { record, .. } => Err(record.malformed(record.consumed)),
            ParserState::Header if self.reader.pending() != 0 => {
                Err(Error::MalformedInput { tag: 0, index: 0 })
            }
            ParserState::Header => Ok(()),
        }
    }

    fn step(
        state: &mut ParserState,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        match state {
            ParserState::Header => {
                let Some(bytes) = feed.gather(TLV_HEADER_LEN) else {
                    return Ok(Step::NeedMore);
                };
                let raw_tag = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let length = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                let crc_before_value = feed.crc_snapshot();
                let record = Self::begin_record(raw_tag, length)?;
                let handler = Self::dispatch(&record, crc_before_value)?;
                log::debug!(
                    "record tag 0x{:02x} length {}",
                    record.raw_tag,
                    record.length
                );
                *state = ParserState::Value { record, handler };
                Ok(Step::Progress)
            }
            ParserState::Value { record, handler } => {
                Self::value_step(record, handler, feed, sink)
            }
        }
    }

    fn begin_record(raw_tag: u32, length: u32) -> Result<RecordContext> {
        let tag = Tag::try_from(raw_tag).map_err(|_| Error::UnknownTag(raw_tag))?;
        let record = RecordContext {
            tag,
            raw_tag,
            length,
            consumed: 0,
        };
        if let Some(expected) = tag.fixed_len() {
            if length != expected {
                return Err(record.malformed(0));
            }
        }
        Ok(record)
    }

    /// Entry validation against the declared length, then the initial
    /// continuation for the record's family.
    fn dispatch(record: &RecordContext, crc_before_value: u32) -> Result<Handler> {
        let len = record.length;
        let handler = match record.tag {
            Tag::Magic => Handler::Magic,
            Tag::PackagerVersion => Handler::Discard,
            Tag::Checksum => Handler::Checksum {
                expected: crc_before_value,
            },
            Tag::InterfaceVersion => Handler::Identity,
            Tag::PackageVersion | Tag::FirmwareVersion | Tag::DspFirmwareVersion => {
                if len as usize > STRING_CAP {
                    return Err(record.malformed(0));
                }
                let kind = match record.tag {
                    Tag::FirmwareVersion => StringKind::Firmware,
                    Tag::DspFirmwareVersion => StringKind::DspFirmware,
                    _ => StringKind::Package,
                };
                Handler::VersionString { kind }
            }
            Tag::Labels => {
                if len as usize > LABELS_CAP {
                    return Err(record.malformed(0));
                }
                Handler::Labels
            }
            Tag::BoardCalibrationV1
            | Tag::BoardCalibrationV2
            | Tag::BoardCalibrationV3
            | Tag::BoardCalibrationV4
            | Tag::Softmax
            | Tag::DnnPowerConfig
            | Tag::PdmConfig
            | Tag::I2sConfig
            | Tag::MicSettings
            | Tag::GainConfig
            | Tag::PinMux
            | Tag::AlgoAttach => Handler::ConfigRecord,
            Tag::McuFirmware => Self::image(ImageKind::McuFirmware),
            Tag::DspFirmware => Self::image(ImageKind::DspFirmware),
            Tag::NnParameters => Self::image(ImageKind::NnParameters),
            Tag::McuFirmwareEncrypted => Self::segments(ImageKind::McuFirmware),
            Tag::DspFirmwareEncrypted => Self::segments(ImageKind::DspFirmware),
            Tag::NnParametersEncrypted => Self::segments(ImageKind::NnParameters),
            Tag::DspAlgoParams => Self::segments(ImageKind::DspAlgo),
            Tag::NnMetadata => {
                if len < core::mem::size_of::<NnMetadataHeader>() as u32 {
                    return Err(record.malformed(0));
                }
                Handler::NnMetadata(NnMetadataState {
                    phase: NnPhase::Count,
                    network_count: 0,
                    network: 0,
                    layer_count: 0,
                    cached: false,
                    layer: 0,
                })
            }
            Tag::OrchestratorGraph => {
                let header = core::mem::size_of::<GraphHeader>() as u32;
                let node = core::mem::size_of::<GraphNode>() as u32;
                if len < header || (len - header) % node != 0 {
                    return Err(record.malformed(0));
                }
                if (len - header) / node > MAX_GRAPH_NODES {
                    return Err(record.malformed(0));
                }
                Handler::Graph(GraphState {
                    header_done: false,
                    flow_bitmap: 0,
                    nodes: 0,
                })
            }
            Tag::PosteriorV4 | Tag::PosteriorV5 | Tag::PosteriorV6 | Tag::PosteriorV7 => {
                // Geometry is known once the counts arrive; here only the
                // minimum length is checkable.
                let Some(shape) = PosteriorShape::for_tag(record.tag) else {
                    return Err(record.malformed(0));
                };
                if len < shape.expected_len(0, 0) {
                    return Err(record.malformed(0));
                }
                Handler::Posterior(PosteriorProgress {
                    shape,
                    phase: PosteriorPhase::Counts,
                    num_states: 0,
                    num_classes: 0,
                    state: 0,
                    class: 0,
                })
            }
            Tag::FrontEndV3 => {
                if len < core::mem::size_of::<FrontEndHeader>() as u32 {
                    return Err(record.malformed(0));
                }
                Handler::FrontEnd(FrontEndState {
                    phase: FrontEndPhase::Header,
                    entries: 0,
                    delivered: 0,
                    pad: 0,
                })
            }
            Tag::SensorConfig => {
                let rec = SENSOR_RECORD_LEN as u32;
                if len % rec != 0 || len / rec > MAX_SENSORS as u32 {
                    return Err(record.malformed(0));
                }
                Handler::Sensors { index: 0 }
            }
            Tag::DspFlowCollection => {
                let rec = core::mem::size_of::<FlowRule>() as u32;
                if len % rec != 0 || len / rec > MAX_FLOW_RULES {
                    return Err(record.malformed(0));
                }
                Handler::Flow { rules: 0 }
            }
        };
        Ok(handler)
    }

    fn image(kind: ImageKind) -> Handler {
        Handler::Image {
            kind,
            begun: false,
            delivered: 0,
        }
    }

    fn segments(kind: ImageKind) -> Handler {
        Handler::Segments(SegmentProgress {
            kind,
            begun: false,
            address: 0,
            remaining: 0,
        })
    }

    fn value_step(
        record: &mut RecordContext,
        handler: &mut Handler,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        match handler {
            Handler::Magic => {
                let Some(bytes) = gather_field(record, feed, 4, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let value = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if value != MAGIC_VALUE {
                    return Err(record.malformed(0));
                }
                Ok(Step::RecordDone)
            }
            Handler::Discard => {
                if feed.skip(record.length as usize) {
                    record.consumed = record.length;
                    Ok(Step::RecordDone)
                } else {
                    Ok(Step::NeedMore)
                }
            }
            Handler::Checksum { expected } => {
                let expected = *expected;
                let Some(bytes) = gather_field(record, feed, 4, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let stored = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                if stored != expected {
                    log::warn!(
                        "package checksum 0x{:08x} does not match computed 0x{:08x}",
                        stored,
                        expected
                    );
                    return Err(Error::ChecksumMismatch);
                }
                Ok(Step::RecordDone)
            }
            Handler::Identity => {
                let n = core::mem::size_of::<InterfaceVersion>();
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let version =
                    InterfaceVersion::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
                sink.commit(PackageEvent::Identity(version))?;
                Ok(Step::RecordDone)
            }
            Handler::VersionString { kind } => {
                let kind = *kind;
                let n = record.length as usize;
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::VersionString { kind, bytes })?;
                Ok(Step::RecordDone)
            }
            Handler::Labels => {
                let n = record.length as usize;
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::Labels { bytes })?;
                Ok(Step::RecordDone)
            }
            Handler::ConfigRecord => {
                let n = record.length as usize;
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::ConfigRecord {
                    tag: record.tag,
                    bytes,
                })?;
                Ok(Step::RecordDone)
            }
            Handler::Image {
                kind,
                begun,
                delivered,
            } => {
                let kind = *kind;
                if !*begun {
                    *begun = true;
                    sink.commit(PackageEvent::ImageBegin {
                        kind,
                        total: record.length,
                    })?;
                    return Ok(Step::Progress);
                }
                if record.remaining() == 0 {
                    sink.commit(PackageEvent::ImageEnd { kind })?;
                    return Ok(Step::RecordDone);
                }
                let bytes = feed.span(record.remaining() as usize);
                if bytes.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let offset = *delivered;
                record.consumed += bytes.len() as u32;
                *delivered += bytes.len() as u32;
                sink.commit(PackageEvent::ImageChunk {
                    kind,
                    offset,
                    bytes,
                })?;
                Ok(Step::Progress)
            }
            Handler::Segments(seg) => {
                if !seg.begun {
                    seg.begun = true;
                    sink.commit(PackageEvent::ImageBegin {
                        kind: seg.kind,
                        total: record.length,
                    })?;
                    return Ok(Step::Progress);
                }
                if seg.remaining == 0 {
                    if record.remaining() == 0 {
                        sink.commit(PackageEvent::ImageEnd { kind: seg.kind })?;
                        return Ok(Step::RecordDone);
                    }
                    // A truncated micro-header cannot be valid.
                    if record.remaining() < SEGMENT_HEADER_LEN as u32 {
                        return Err(record.malformed(record.consumed));
                    }
                    let Some(bytes) = gather_field(record, feed, SEGMENT_HEADER_LEN, 0)? else {
                        return Ok(Step::NeedMore);
                    };
                    let header =
                        SegmentHeader::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
                    if header.length > record.remaining() {
                        return Err(record.malformed(record.consumed));
                    }
                    seg.address = header.address;
                    seg.remaining = header.length;
                    return Ok(Step::Progress);
                }
                let bytes = feed.span(seg.remaining as usize);
                if bytes.is_empty() {
                    return Ok(Step::NeedMore);
                }
                let address = seg.address;
                record.consumed += bytes.len() as u32;
                seg.address += bytes.len() as u32;
                seg.remaining -= bytes.len() as u32;
                sink.commit(PackageEvent::SegmentChunk {
                    kind: seg.kind,
                    address,
                    bytes,
                })?;
                Ok(Step::Progress)
            }
            Handler::NnMetadata(nn) => Self::nn_metadata_step(record, nn, feed, sink),
            Handler::Graph(graph) => Self::graph_step(record, graph, feed, sink),
            Handler::Posterior(post) => Self::posterior_step(record, post, feed, sink),
            Handler::FrontEnd(fe) => Self::front_end_step(record, fe, feed, sink),
            Handler::Sensors { index } => {
                if record.remaining() == 0 {
                    return Ok(Step::RecordDone);
                }
                let Some(bytes) = gather_field(record, feed, SENSOR_RECORD_LEN, *index)? else {
                    return Ok(Step::NeedMore);
                };
                let rec =
                    SensorRecord::read_from_bytes(bytes).map_err(|_| record.malformed(*index))?;
                sink.commit(PackageEvent::SensorRecord {
                    index: *index,
                    record: rec,
                })?;
                *index += 1;
                if record.remaining() == 0 {
                    Ok(Step::RecordDone)
                } else {
                    Ok(Step::Progress)
                }
            }
            Handler::Flow { rules } => {
                if record.remaining() == 0 {
                    sink.commit(PackageEvent::FlowApply { rules: *rules })?;
                    return Ok(Step::RecordDone);
                }
                let n = core::mem::size_of::<FlowRule>();
                let Some(bytes) = gather_field(record, feed, n, *rules)? else {
                    return Ok(Step::NeedMore);
                };
                let rule = FlowRule::read_from_bytes(bytes).map_err(|_| record.malformed(*rules))?;
                sink.commit(PackageEvent::FlowRule {
                    index: *rules,
                    rule,
                })?;
                *rules += 1;
                if record.remaining() == 0 {
                    sink.commit(PackageEvent::FlowApply { rules: *rules })?;
                    return Ok(Step::RecordDone);
                }
                Ok(Step::Progress)
            }
        }
    }

    fn nn_metadata_step(
        record: &mut RecordContext,
        nn: &mut NnMetadataState,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        match nn.phase {
            NnPhase::Count => {
                let n = core::mem::size_of::<NnMetadataHeader>();
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let header =
                    NnMetadataHeader::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
                if header.network_count == 0 || header.network_count > MAX_NETWORKS as u32 {
                    return Err(record.malformed(0));
                }
                nn.network_count = header.network_count;
                nn.phase = NnPhase::NetworkMeta;
                sink.commit(PackageEvent::NetworkCount(header.network_count))?;
                Ok(Step::Progress)
            }
            NnPhase::NetworkMeta => {
                let n = core::mem::size_of::<NnNetworkMeta>();
                let Some(bytes) = gather_field(record, feed, n, nn.network)? else {
                    return Ok(Step::NeedMore);
                };
                let meta =
                    NnNetworkMeta::read_from_bytes(bytes).map_err(|_| record.malformed(nn.network))?;
                if meta.layer_count == 0 || meta.layer_count > MAX_LAYERS as u32 {
                    return Err(record.malformed(nn.network));
                }
                nn.layer_count = meta.layer_count;
                nn.cached = meta.cached != 0;
                nn.layer = 0;
                nn.phase = NnPhase::LayerInput;
                sink.commit(PackageEvent::NetworkMeta {
                    network: nn.network,
                    meta,
                })?;
                Ok(Step::Progress)
            }
            NnPhase::LayerInput => {
                let Some(bytes) = gather_field(record, feed, 4, nn.layer)? else {
                    return Ok(Step::NeedMore);
                };
                let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                nn.phase = NnPhase::LayerCoords;
                sink.commit(PackageEvent::LayerInputSize {
                    network: nn.network,
                    layer: nn.layer,
                    size,
                })?;
                Ok(Step::Progress)
            }
            NnPhase::LayerCoords => {
                let n = core::mem::size_of::<NnLayerCoords>();
                let Some(bytes) = gather_field(record, feed, n, nn.layer)? else {
                    return Ok(Step::NeedMore);
                };
                let coords =
                    NnLayerCoords::read_from_bytes(bytes).map_err(|_| record.malformed(nn.layer))?;
                sink.commit(PackageEvent::LayerCoords {
                    network: nn.network,
                    layer: nn.layer,
                    coords,
                })?;
                if nn.cached {
                    nn.phase = NnPhase::LayerCache;
                } else {
                    Self::nn_advance(nn);
                }
                Self::nn_step_outcome(record, nn)
            }
            NnPhase::LayerCache => {
                let n = core::mem::size_of::<NnCacheInstructions>();
                let Some(bytes) = gather_field(record, feed, n, nn.layer)? else {
                    return Ok(Step::NeedMore);
                };
                let inst = NnCacheInstructions::read_from_bytes(bytes)
                    .map_err(|_| record.malformed(nn.layer))?;
                sink.commit(PackageEvent::LayerCache {
                    network: nn.network,
                    layer: nn.layer,
                    inst,
                })?;
                Self::nn_advance(nn);
                Self::nn_step_outcome(record, nn)
            }
            // A completed walk always ends the record in the same step.
            NnPhase::Done => Err(record.malformed(nn.network)),
        }
    }

    fn nn_advance(nn: &mut NnMetadataState) {
        nn.layer += 1;
        if nn.layer == nn.layer_count {
            nn.network += 1;
            if nn.network == nn.network_count {
                nn.phase = NnPhase::Done;
            } else {
                nn.phase = NnPhase::NetworkMeta;
            }
        } else {
            nn.phase = NnPhase::LayerInput;
        }
    }

    fn nn_step_outcome(record: &RecordContext, nn: &NnMetadataState) -> Result<Step> {
        if nn.phase == NnPhase::Done {
            if record.remaining() != 0 {
                return Err(record.malformed(nn.network));
            }
            Ok(Step::RecordDone)
        } else {
            if record.remaining() == 0 {
                return Err(record.malformed(nn.network));
            }
            Ok(Step::Progress)
        }
    }

    fn graph_step(
        record: &mut RecordContext,
        graph: &mut GraphState,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        if !graph.header_done {
            let n = core::mem::size_of::<GraphHeader>();
            let Some(bytes) = gather_field(record, feed, n, 0)? else {
                return Ok(Step::NeedMore);
            };
            let header = GraphHeader::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
            graph.flow_bitmap = header.flow_bitmap;
            graph.header_done = true;
            return Ok(Step::Progress);
        }
        if record.remaining() == 0 {
            sink.commit(PackageEvent::GraphApply {
                nodes: graph.nodes,
                flow_bitmap: graph.flow_bitmap,
            })?;
            return Ok(Step::RecordDone);
        }
        let n = core::mem::size_of::<GraphNode>();
        let Some(bytes) = gather_field(record, feed, n, graph.nodes)? else {
            return Ok(Step::NeedMore);
        };
        let node = GraphNode::read_from_bytes(bytes).map_err(|_| record.malformed(graph.nodes))?;
        if node.num_inputs as usize > GRAPH_NODE_FANOUT
            || node.num_outputs as usize > GRAPH_NODE_FANOUT
        {
            return Err(record.malformed(graph.nodes));
        }
        sink.commit(PackageEvent::GraphNode {
            index: graph.nodes,
            node,
        })?;
        graph.nodes += 1;
        if record.remaining() == 0 {
            sink.commit(PackageEvent::GraphApply {
                nodes: graph.nodes,
                flow_bitmap: graph.flow_bitmap,
            })?;
            return Ok(Step::RecordDone);
        }
        Ok(Step::Progress)
    }

    fn posterior_step(
        record: &mut RecordContext,
        post: &mut PosteriorProgress,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        match post.phase {
            PosteriorPhase::Counts => {
                let n = core::mem::size_of::<PosteriorHeader>();
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let header =
                    PosteriorHeader::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
                if header.num_states == 0
                    || header.num_states > MAX_STATES
                    || header.num_classes == 0
                    || header.num_classes > MAX_CLASSES
                {
                    return Err(record.malformed(0));
                }
                // The whole record geometry follows from the two counts.
                if post.shape.expected_len(header.num_states, header.num_classes) != record.length {
                    return Err(record.malformed(0));
                }
                post.num_states = header.num_states;
                post.num_classes = header.num_classes;
                post.phase = PosteriorPhase::Extra;
                Ok(Step::Progress)
            }
            PosteriorPhase::Extra => {
                let n = post.shape.extra_header as usize;
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::PosteriorBegin {
                    shape: post.shape,
                    num_states: post.num_states,
                    num_classes: post.num_classes,
                    extra: bytes,
                })?;
                post.state = 0;
                post.phase = PosteriorPhase::State;
                Ok(Step::Progress)
            }
            PosteriorPhase::State => {
                let n = post.shape.state_len as usize;
                let Some(bytes) = gather_field(record, feed, n, post.state)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::PosteriorState {
                    tag: post.shape.tag,
                    state: post.state,
                    bytes,
                })?;
                post.class = 0;
                post.phase = PosteriorPhase::Class;
                Ok(Step::Progress)
            }
            PosteriorPhase::Class => {
                let n = post.shape.class_len as usize;
                let Some(bytes) = gather_field(record, feed, n, post.class)? else {
                    return Ok(Step::NeedMore);
                };
                sink.commit(PackageEvent::PosteriorClass {
                    tag: post.shape.tag,
                    state: post.state,
                    class: post.class,
                    bytes,
                })?;
                post.class += 1;
                if post.class == post.num_classes {
                    post.state += 1;
                    if post.state == post.num_states {
                        return Ok(Step::RecordDone);
                    }
                    post.phase = PosteriorPhase::State;
                }
                Ok(Step::Progress)
            }
        }
    }

    fn front_end_step(
        record: &mut RecordContext,
        fe: &mut FrontEndState,
        feed: &mut Feed<'_, '_>,
        sink: &mut dyn PackageSink,
    ) -> Result<Step> {
        match fe.phase {
            FrontEndPhase::Header => {
                let n = core::mem::size_of::<FrontEndHeader>();
                let Some(bytes) = gather_field(record, feed, n, 0)? else {
                    return Ok(Step::NeedMore);
                };
                let header =
                    FrontEndHeader::read_from_bytes(bytes).map_err(|_| record.malformed(0))?;
                if header.filter_count == 0 || header.filter_count > MAX_FILTERS {
                    return Err(record.malformed(0));
                }
                // The boundary table length must agree with the declared
                // record length before any slice is committed.
                let expected = n as u32 + header.boundary_entries() * 2 + header.pad_bytes();
                if expected != record.length {
                    return Err(record.malformed(0));
                }
                fe.entries = header.boundary_entries();
                fe.pad = header.pad_bytes();
                fe.phase = FrontEndPhase::Boundaries;
                sink.commit(PackageEvent::FrontEndBegin(header))?;
                Ok(Step::Progress)
            }
            FrontEndPhase::Boundaries => {
                // Fixed pacing: at most BOUNDARY_SLICE entries per step.
                let slice = (fe.entries - fe.delivered).min(BOUNDARY_SLICE as u32) as usize;
                let Some(bytes) = gather_field(record, feed, slice * 2, fe.delivered)? else {
                    return Ok(Step::NeedMore);
                };
                let mut entries = [0u16; BOUNDARY_SLICE];
                for (i, pair) in bytes.chunks_exact(2).enumerate() {
                    entries[i] = u16::from_le_bytes([pair[0], pair[1]]);
                }
                sink.commit(PackageEvent::FrontEndBoundaries {
                    offset: fe.delivered,
                    entries: &entries[..slice],
                })?;
                fe.delivered += slice as u32;
                if fe.delivered == fe.entries {
                    if fe.pad == 0 {
                        return Ok(Step::RecordDone);
                    }
                    fe.phase = FrontEndPhase::Pad;
                }
                Ok(Step::Progress)
            }
            FrontEndPhase::Pad => {
                let Some(_) = gather_field(record, feed, fe.pad as usize, fe.delivered)? else {
                    return Ok(Step::NeedMore);
                };
                Ok(Step::RecordDone)
            }
        }
    }
}

impl Default for PackageParser {
    fn default() -> Self {
        PackageParser::new()
    }
}

/// Gather a value field, guarded against reading past the record's
/// declared length.
fn gather_field<'x>(
    record: &mut RecordContext,
    feed: &'x mut Feed<'_, '_>,
    n: usize,
    index: u32,
) -> Result<Option<&'x [u8]>> {
    if record.remaining() < n as u32 || n > VALUE_SCRATCH {
        return Err(record.malformed(index));
    }
    match feed.gather(n) {
        Some(bytes) => {
            record.consumed += n as u32;
            Ok(Some(bytes))
        }
        None => Ok(None),
    }
}
