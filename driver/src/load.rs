// Licensed under the Apache-2.0 license

//! Package load engine
//!
//! [`DeviceSink`] turns the parser's commit events into device traffic:
//! image bytes land in the per-core load windows around a halt/boot
//! bracket, neural-network metadata is written into the DNN config
//! block, graph nodes go to the orchestrator block, and everything else
//! is staged at the open-RAM window and handed over with an extended
//! op. Identity and version records only touch the scratch shadow; the
//! session flushes it once the package ends.
//!
//! Secured parts never see the parser. Raw package bytes stream through
//! the open-RAM window to the bootloader, which does its own
//! verification and boots the cores itself.

use aoncore_bus::{read_word, write_word, BusTransport, MemoryRegion};
use zerocopy::IntoBytes;

use crate::chip::{ChipType, ChipVariant};
use crate::error::{Error, Result};
use crate::mailbox::{ExtOp, MailboxChannel, Opcode};
use crate::package::{
    ImageKind, InterfaceVersion, PackageEvent, PackageSink, Tag, BOUNDARY_SLICE, MAX_LAYERS,
};
use crate::scratch::ScratchRegion;
use crate::session::{fw_state, FirmwareAddresses};

/// Global chip control register: core halt bits plus the host interrupt
/// enable.
pub const CHIP_CONTROL: u32 = 0x4000_0000;
pub const CTL_MCU_HALT: u32 = 1 << 0;
pub const CTL_DSP_HALT: u32 = 1 << 1;
pub const CTL_INT_ENABLE: u32 = 1 << 2;
pub const CTL_SOFT_RESET: u32 = 1 << 31;

/// Security posture register. While the lock bit is set, package bytes
/// may only reach the device through the secured bootloader.
pub const SEC_STATUS: u32 = 0x4000_000c;
pub const SEC_LOCKED: u32 = 1 << 0;

/// `ExtOp::BootStatus` result once firmware main is up.
pub const BOOT_RUNNING: u32 = 1;

/// Package binary-interface version this driver speaks. A package that
/// declares another major is refused at end of load.
pub const INTERFACE_MAJOR: u32 = 2;
pub const INTERFACE_MINOR: u32 = 4;

/// DNN config block geometry, relative to the dnn pointer published in
/// the control-MCU state block.
pub const DNN_NETWORK_COUNT: u32 = 0x00;
pub const DNN_NETWORKS: u32 = 0x04;
/// Input size word, coordinate pair, cache instructions.
pub const DNN_LAYER_STRIDE: u32 = 28;
pub const DNN_NETWORK_STRIDE: u32 = 8 + MAX_LAYERS as u32 * DNN_LAYER_STRIDE;

/// Orchestrator graph block geometry.
pub const GRAPH_NODE_COUNT: u32 = 0x00;
pub const GRAPH_FLOW_BITMAP: u32 = 0x04;
pub const GRAPH_NODES: u32 = 0x08;
pub const GRAPH_NODE_LEN: u32 = 16;

/// Cross-chunk state for one package load, reset by the session when a
/// package finishes or a fresh load starts.
#[derive(Debug, Default)]
pub struct LoadProgress {
    pub(crate) started: bool,
    pub(crate) secure: bool,
    pub(crate) secure_offset: u32,
    pub(crate) identity: Option<InterfaceVersion>,
    metadata_done: bool,
    parameters_done: bool,
    prepare_sent: bool,
    nn_total: u32,
    cur_layers: u32,
    cur_cached: bool,
}

impl LoadProgress {
    pub fn started(&self) -> bool {
        self.started
    }

    pub fn prepare_sent(&self) -> bool {
        self.prepare_sent
    }
}

/// Device-backed package sink. Borrows the session's collaborators for
/// the duration of one feed call.
pub struct DeviceSink<'a> {
    pub(crate) bus: &'a mut dyn BusTransport,
    pub(crate) host: &'a mut MailboxChannel,
    pub(crate) dsp: &'a mut MailboxChannel,
    pub(crate) chip: &'static dyn ChipVariant,
    pub(crate) scratch: &'a mut ScratchRegion,
    pub(crate) progress: &'a mut LoadProgress,
    pub(crate) addresses: &'a mut FirmwareAddresses,
}

impl PackageSink for DeviceSink<'_> {
    fn commit(&mut self, event: PackageEvent<'_>) -> Result<()> {
        match event {
            PackageEvent::Identity(identity) => {
                self.progress.identity = Some(identity);
                self.scratch.set_identity(&identity);
                Ok(())
            }
            PackageEvent::VersionString { kind, bytes } => self.scratch.set_version(kind, bytes),
            PackageEvent::Labels { bytes } => self.scratch.set_labels(bytes),
            PackageEvent::ConfigRecord { tag, bytes } => {
                self.stage_apply(ExtOp::ApplyConfig, tag, u32::from(tag), bytes)
            }
            PackageEvent::ImageBegin { kind, total } => self.image_begin(kind, total),
            PackageEvent::ImageChunk {
                kind,
                offset,
                bytes,
            } => self.image_chunk(kind, offset, bytes),
            PackageEvent::SegmentChunk {
                kind,
                address,
                bytes,
            } => self.segment_chunk(kind, address, bytes),
            PackageEvent::ImageEnd { kind } => self.image_end(kind),
            PackageEvent::NetworkCount(count) => {
                self.progress.nn_total = count;
                let base = self.dnn_base()?;
                write_word(
                    self.bus,
                    MemoryRegion::Mcu,
                    base + DNN_NETWORK_COUNT,
                    count,
                )?;
                Ok(())
            }
            PackageEvent::NetworkMeta { network, meta } => {
                self.progress.cur_layers = meta.layer_count;
                self.progress.cur_cached = meta.cached != 0;
                let base = self.network_base(network)?;
                self.bus
                    .write(MemoryRegion::Mcu, base, meta.as_bytes())?;
                Ok(())
            }
            PackageEvent::LayerInputSize {
                network,
                layer,
                size,
            } => {
                let base = self.layer_base(network, layer)?;
                write_word(self.bus, MemoryRegion::Mcu, base, size)?;
                Ok(())
            }
            PackageEvent::LayerCoords {
                network,
                layer,
                coords,
            } => {
                let base = self.layer_base(network, layer)?;
                self.bus
                    .write(MemoryRegion::Mcu, base + 4, coords.as_bytes())?;
                if !self.progress.cur_cached {
                    self.layer_complete(network, layer)?;
                }
                Ok(())
            }
            PackageEvent::LayerCache {
                network,
                layer,
                inst,
            } => {
                let base = self.layer_base(network, layer)?;
                self.bus
                    .write(MemoryRegion::Mcu, base + 12, inst.as_bytes())?;
                self.layer_complete(network, layer)?;
                Ok(())
            }
            PackageEvent::GraphNode { index, node } => {
                let base = self.graph_base()?;
                self.bus.write(
                    MemoryRegion::Mcu,
                    base + GRAPH_NODES + index * GRAPH_NODE_LEN,
                    node.as_bytes(),
                )?;
                Ok(())
            }
            PackageEvent::GraphApply { nodes, flow_bitmap } => {
                let base = self.graph_base()?;
                write_word(self.bus, MemoryRegion::Mcu, base + GRAPH_FLOW_BITMAP, flow_bitmap)?;
                // Node count last; firmware treats a nonzero count as
                // the whole block being valid.
                write_word(self.bus, MemoryRegion::Mcu, base + GRAPH_NODE_COUNT, nodes)?;
                log::debug!("orchestrator graph applied, {} nodes", nodes);
                Ok(())
            }
            PackageEvent::PosteriorBegin {
                shape,
                num_states,
                num_classes,
                extra,
            } => {
                let mut header = [0u8; 24];
                header[0..4].copy_from_slice(&shape.version.to_le_bytes());
                header[4..8].copy_from_slice(&num_states.to_le_bytes());
                header[8..12].copy_from_slice(&num_classes.to_le_bytes());
                header[12..12 + extra.len()].copy_from_slice(extra);
                self.stage_apply(ExtOp::PosteriorBegin, shape.tag, 0, &header[..12 + extra.len()])
            }
            PackageEvent::PosteriorState { tag, state, bytes } => {
                self.stage_apply(ExtOp::PosteriorState, tag, state, bytes)
            }
            PackageEvent::PosteriorClass {
                tag,
                state,
                class,
                bytes,
            } => self.stage_apply(ExtOp::PosteriorClass, tag, state << 16 | class, bytes),
            PackageEvent::FrontEndBegin(header) => {
                self.stage_apply(ExtOp::FrontEndBegin, Tag::FrontEndV3, 0, header.as_bytes())
            }
            PackageEvent::FrontEndBoundaries { offset, entries } => {
                let mut packed = [0u8; BOUNDARY_SLICE * 2];
                for (slot, entry) in entries.iter().enumerate() {
                    packed[slot * 2..slot * 2 + 2].copy_from_slice(&entry.to_le_bytes());
                }
                self.stage_apply(
                    ExtOp::FrontEndBoundaries,
                    Tag::FrontEndV3,
                    offset,
                    &packed[..entries.len() * 2],
                )
            }
            PackageEvent::SensorRecord { index, record } => {
                if index as usize >= self.chip.sensor_slots() {
                    return Err(Error::Unsupported);
                }
                self.scratch.set_sensor(index as usize, &record)
            }
            PackageEvent::FlowRule { index, rule } => {
                self.stage_apply(ExtOp::FlowRule, Tag::DspFlowCollection, index, rule.as_bytes())
            }
            PackageEvent::FlowApply { rules } => {
                self.host
                    .extended(self.bus, ExtOp::FlowApply.into(), [rules, 0])?;
                Ok(())
            }
        }
    }
}

impl DeviceSink<'_> {
    fn window_for(&self, kind: ImageKind) -> crate::chip::AddressWindow {
        match kind {
            ImageKind::McuFirmware => self.chip.mcu_fw_window(),
            _ => self.chip.dsp_fw_window(),
        }
    }

    fn tag_for(kind: ImageKind) -> Tag {
        match kind {
            ImageKind::McuFirmware => Tag::McuFirmware,
            ImageKind::DspFirmware => Tag::DspFirmware,
            ImageKind::NnParameters => Tag::NnParameters,
            ImageKind::DspAlgo => Tag::DspAlgoParams,
        }
    }

    fn image_begin(&mut self, kind: ImageKind, total: u32) -> Result<()> {
        match kind {
            ImageKind::McuFirmware => {
                log::info!("loading control firmware, {} bytes", total);
                // Every discovered address dies with the old firmware.
                *self.addresses = FirmwareAddresses::default();
                self.halt(CTL_MCU_HALT)?;
                self.host.begin_resync();
            }
            ImageKind::DspFirmware => {
                log::info!("loading signal-processor firmware, {} bytes", total);
                self.addresses.dsp_state = None;
                self.halt(CTL_DSP_HALT)?;
                self.dsp.begin_resync();
            }
            _ => {}
        }
        let window = self.window_for(kind);
        if total > window.len {
            return Err(Error::malformed(Self::tag_for(kind).into()));
        }
        Ok(())
    }

    fn image_chunk(&mut self, kind: ImageKind, offset: u32, bytes: &[u8]) -> Result<()> {
        let window = self.window_for(kind);
        if !window.contains(window.base + offset, bytes.len() as u32) {
            return Err(Error::malformed(Self::tag_for(kind).into()));
        }
        self.bus.write(window.region, window.base + offset, bytes)?;
        Ok(())
    }

    fn segment_chunk(&mut self, kind: ImageKind, address: u32, bytes: &[u8]) -> Result<()> {
        let window = self.window_for(kind);
        if !window.contains(address, bytes.len() as u32) {
            return Err(Error::malformed(Self::tag_for(kind).into()));
        }
        self.bus.write(window.region, address, bytes)?;
        Ok(())
    }

    fn image_end(&mut self, kind: ImageKind) -> Result<()> {
        match kind {
            ImageKind::McuFirmware => {
                self.release(CTL_MCU_HALT)?;
                discover_mcu(self.bus, self.host, self.addresses)
            }
            ImageKind::DspFirmware => {
                self.release(CTL_DSP_HALT)?;
                discover_dsp(self.bus, self.dsp, self.addresses)
            }
            ImageKind::NnParameters => {
                self.progress.parameters_done = true;
                self.maybe_prepare()
            }
            ImageKind::DspAlgo => Ok(()),
        }
    }

    fn halt(&mut self, bits: u32) -> Result<()> {
        let ctl = read_word(self.bus, MemoryRegion::Mcu, CHIP_CONTROL)?;
        write_word(self.bus, MemoryRegion::Mcu, CHIP_CONTROL, ctl | bits)?;
        Ok(())
    }

    fn release(&mut self, bits: u32) -> Result<()> {
        let ctl = read_word(self.bus, MemoryRegion::Mcu, CHIP_CONTROL)?;
        write_word(
            self.bus,
            MemoryRegion::Mcu,
            CHIP_CONTROL,
            (ctl & !bits) | CTL_INT_ENABLE,
        )?;
        Ok(())
    }

    fn dnn_base(&self) -> Result<u32> {
        self.addresses.dnn.ok_or(Error::Uninitialized)
    }

    fn graph_base(&self) -> Result<u32> {
        self.addresses.graph.ok_or(Error::Uninitialized)
    }

    fn network_base(&self, network: u32) -> Result<u32> {
        Ok(self.dnn_base()? + DNN_NETWORKS + network * DNN_NETWORK_STRIDE)
    }

    fn layer_base(&self, network: u32, layer: u32) -> Result<u32> {
        Ok(self.network_base(network)? + 8 + layer * DNN_LAYER_STRIDE)
    }

    fn layer_complete(&mut self, network: u32, layer: u32) -> Result<()> {
        if network + 1 == self.progress.nn_total && layer + 1 == self.progress.cur_layers {
            self.progress.metadata_done = true;
            return self.maybe_prepare();
        }
        Ok(())
    }

    /// `PREPARE` exactly once, after both the parameters image and the
    /// network metadata have landed.
    fn maybe_prepare(&mut self) -> Result<()> {
        if self.progress.metadata_done && self.progress.parameters_done && !self.progress.prepare_sent
        {
            self.host.command(self.bus, Opcode::Prepare)?;
            self.progress.prepare_sent = true;
            log::debug!("inference prepared");
        }
        Ok(())
    }

    /// Stage a blob at the open-RAM window and hand it over. The blob
    /// length traces back to a record length, so an oversized one is
    /// malformed input, refused before any byte moves.
    fn stage_apply(&mut self, op: ExtOp, tag: Tag, meta: u32, blob: &[u8]) -> Result<()> {
        let staging = self.chip.open_ram();
        if blob.len() as u32 > staging.len {
            return Err(Error::malformed(tag.into()));
        }
        if !blob.is_empty() {
            self.bus.write(staging.region, staging.base, blob)?;
        }
        self.host
            .extended(self.bus, op.into(), [meta, blob.len() as u32])?;
        Ok(())
    }
}

/// Boot-side discovery after the control MCU comes out of halt: sync the
/// mailbox, confirm the run state, then pull the state block address and
/// the pointers it publishes.
pub(crate) fn discover_mcu(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    addresses: &mut FirmwareAddresses,
) -> Result<()> {
    host.handshake(bus)?;
    let status = host.extended(bus, ExtOp::BootStatus.into(), [0, 0])?;
    if status[0] != BOOT_RUNNING {
        log::error!("control firmware reports boot status {}", status[0]);
        return Err(Error::DeviceReported(status[0]));
    }
    let state = host.read_address(bus)?;
    addresses.mcu_state = Some(state);
    addresses.graph = Some(read_word(
        bus,
        MemoryRegion::Mcu,
        state + fw_state::MCU_GRAPH_PTR,
    )?);
    addresses.dnn = Some(read_word(
        bus,
        MemoryRegion::Mcu,
        state + fw_state::MCU_DNN_PTR,
    )?);
    addresses.debug = Some(read_word(
        bus,
        MemoryRegion::Mcu,
        state + fw_state::MCU_DEBUG_PTR,
    )?);
    log::info!("control firmware up, state block 0x{:08x}", state);
    Ok(())
}

pub(crate) fn discover_dsp(
    bus: &mut dyn BusTransport,
    dsp: &mut MailboxChannel,
    addresses: &mut FirmwareAddresses,
) -> Result<()> {
    dsp.handshake(bus)?;
    let state = dsp.read_address(bus)?;
    addresses.dsp_state = Some(state);
    log::info!("signal-processor firmware up, state block 0x{:08x}", state);
    Ok(())
}

/// Stream raw secured-package bytes through the bootloader window.
pub(crate) fn secure_chunk(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    chip: &'static dyn ChipVariant,
    progress: &mut LoadProgress,
    mut chunk: &[u8],
) -> Result<()> {
    let window = chip.open_ram();
    while !chunk.is_empty() {
        let take = chunk.len().min(window.len as usize);
        bus.write(window.region, window.base, &chunk[..take])?;
        host.extended(
            bus,
            ExtOp::SecureWindow.into(),
            [progress.secure_offset, take as u32],
        )?;
        progress.secure_offset += take as u32;
        chunk = &chunk[take..];
    }
    Ok(())
}

/// Close a secured load: the bootloader verifies what it was fed and
/// boots both cores, then discovery runs as usual.
pub(crate) fn secure_finish(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    dsp: &mut MailboxChannel,
    addresses: &mut FirmwareAddresses,
    progress: &LoadProgress,
) -> Result<()> {
    host.extended(bus, ExtOp::SecureDone.into(), [progress.secure_offset, 0])?;
    host.begin_resync();
    dsp.begin_resync();
    discover_mcu(bus, host, addresses)?;
    discover_dsp(bus, dsp, addresses)
}

/// End-of-package identity check against the probed chip. A package that
/// never carried an identity record is accepted as-is.
pub fn validate_identity(
    chip: &dyn ChipVariant,
    identity: Option<&InterfaceVersion>,
) -> Result<()> {
    let identity = match identity {
        Some(identity) => identity,
        None => return Ok(()),
    };
    let package_chip = u8::try_from(identity.chip_type)
        .ok()
        .and_then(|code| ChipType::try_from(code).ok())
        .ok_or(Error::Unsupported)?;
    if package_chip != chip.chip_type() || identity.major != INTERFACE_MAJOR {
        log::error!(
            "package is {:?} v{}.{}, driver speaks {:?} v{}.{}",
            package_chip,
            identity.major,
            identity.minor,
            chip.chip_type(),
            INTERFACE_MAJOR,
            INTERFACE_MINOR,
        );
        return Err(Error::Unsupported);
    }
    if identity.minor != INTERFACE_MINOR {
        log::info!(
            "package minor {} differs from driver minor {}",
            identity.minor,
            INTERFACE_MINOR
        );
    }
    Ok(())
}
