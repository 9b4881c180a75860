// Licensed under the Apache-2.0 license

//! Device session
//!
//! One [`DeviceSession`] owns everything host-side about one attached
//! coprocessor: the probed chip variant, both mailbox channels, the
//! package parser, the extraction engine, the scratch shadow, the match
//! bookkeeping, and the addresses discovered from running firmware.
//! Every public entry point brackets the bus with [`BusGuard`] so a
//! shared transport always sees complete transactions.
//!
//! Construction is initialization: a session exists only for a device
//! that answered the probe. `Uninitialized` errors past that point mean
//! an operation needs firmware addresses no load has discovered yet.

use aoncore_bus::{read_word, write_word, BusGuard, BusTransport, MemoryRegion};
use bitfield::bitfield;

use crate::chip::{probe, ChipVariant};
use crate::config::{self, InputSource};
use crate::error::{Error, Result};
use crate::extract::{ExtractDiagnostics, ExtractPolicy, Extractor, RingDescriptor, StreamKind};
use crate::load::{self, validate_identity, DeviceSink, LoadProgress};
use crate::load::{CHIP_CONTROL, CTL_SOFT_RESET, SEC_LOCKED, SEC_STATUS};
use crate::mailbox::{take_device_message, ExtOp, MailboxChannel, MailboxDiagnostics};
use crate::notify::Notifications;
use crate::package::{
    InterfaceVersion, PackageParser, SensorRecord, StringKind, MAX_CLASSES, MAX_NETWORKS,
};
use crate::scratch::ScratchRegion;
use crate::serial::{self, SerialTarget};

/// Firmware state block layouts. Offsets are relative to the block
/// addresses discovered over the mailbox; both blocks are little-endian
/// words like everything else on the device.
pub mod fw_state {
    /// Rolling liveness counter, bumped by the control MCU every beat.
    pub const MCU_HEARTBEAT: u32 = 0x00;
    /// Pending notification bits.
    pub const MCU_NOTIFICATIONS: u32 = 0x04;
    /// Pointers the firmware publishes at boot.
    pub const MCU_GRAPH_PTR: u32 = 0x08;
    pub const MCU_DNN_PTR: u32 = 0x0c;
    pub const MCU_DEBUG_PTR: u32 = 0x10;
    /// Network behind the most recent match.
    pub const MCU_LAST_NETWORK: u32 = 0x14;
    /// Summary word of the most recent match.
    pub const MCU_MATCH_SUMMARY: u32 = 0x18;
    /// Audio tank write pointer captured when the match fired.
    pub const MCU_MATCH_TANK_PTR: u32 = 0x1c;
    /// Per-class hit bitmap of the most recent match, one bit per class.
    pub const MCU_MATCH_BINARY: u32 = 0x20;
    /// Per-network match counters, `[u32; MAX_NETWORKS]`.
    pub const MCU_MATCH_PRODUCER: u32 = 0x24;
    /// Per-network class counts, `[u32; MAX_NETWORKS]`.
    pub const MCU_CLASS_COUNTS: u32 = 0x34;
    /// Strength bytes of the most recent match, one per class.
    pub const MCU_STRENGTH_RAW: u32 = 0x44;
    pub const MCU_STRENGTH_SOFTMAX: u32 = 0x64;

    pub const DSP_HEARTBEAT: u32 = 0x00;
    /// Serial bridge window, control word plus 16 data bytes.
    pub const DSP_SERIAL_WINDOW: u32 = 0x04;
    /// Capture tank descriptor array, one entry per stream kind.
    pub const DSP_TANKS: u32 = 0x18;
    pub const TANK_STRIDE: u32 = 0x1c;
    pub const TANK_BASE: u32 = 0x00;
    pub const TANK_SIZE: u32 = 0x04;
    pub const TANK_SAMPLE: u32 = 0x08;
    pub const TANK_PRODUCER: u32 = 0x0c;
    pub const TANK_CONSUMER: u32 = 0x10;
    pub const TANK_ANNOTATION: u32 = 0x14;
    pub const TANK_FLAGS: u32 = 0x18;
    pub const TANK_FLAG_SAMPLE_RESET: u32 = 1;
}

/// `check_firmware` result bits.
pub const FW_ALIVE_MCU: u32 = 1 << 0;
pub const FW_ALIVE_DSP: u32 = 1 << 1;

/// Microseconds to let the chip settle after a soft reset.
const RESET_SETTLE_US: u32 = 10_000;

bitfield! {
    /// Match summary word published by the posterior handler.
    /// Bits 5:0: winning class
    /// Bit 6: a match actually fired
    /// Bits 15:8: network id
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct MatchSummary(u32);
    impl Debug;
    pub class_index, set_class_index: 5, 0;
    pub matched, set_matched: 6;
    pub network, set_network: 15, 8;
}

/// Block addresses discovered from running firmware. All of them die
/// with a firmware (re)load and are rediscovered afterwards.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirmwareAddresses {
    pub mcu_state: Option<u32>,
    pub dsp_state: Option<u32>,
    pub graph: Option<u32>,
    pub dnn: Option<u32>,
    pub debug: Option<u32>,
}

/// How `init` treats an already-running device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    /// Soft-reset the chip. Firmware must be loaded afterwards.
    Reset,
    /// Leave device state alone; recover what the scratch region and a
    /// handshake with any running firmware can offer.
    Attach,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrengthKind {
    Raw,
    Softmax,
}

/// Session-level operation counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionStats {
    pub operations: u32,
    pub failures: u32,
    pub loads_completed: u32,
    pub notifications_seen: u32,
    pub matches_seen: u32,
}

/// Every counter the session and its parts keep.
#[derive(Debug, Clone, Copy)]
pub struct SessionDiagnostics {
    pub host: MailboxDiagnostics,
    pub dsp: MailboxDiagnostics,
    pub extract: ExtractDiagnostics,
    pub records_parsed: u32,
    pub stats: SessionStats,
}

/// Match snapshot taken by `poll` plus the host-side consumer marks.
#[derive(Debug, Default, Clone, Copy)]
struct MatchState {
    last_network: u32,
    summary: u32,
    tank_ptr: u32,
    binary: [u8; 4],
    producer: [u32; MAX_NETWORKS],
    consumer: [u32; MAX_NETWORKS],
}

/// Host-side handle for one attached coprocessor.
pub struct DeviceSession<'b> {
    bus: &'b mut dyn BusTransport,
    chip: &'static dyn ChipVariant,
    host: MailboxChannel,
    dsp: MailboxChannel,
    parser: PackageParser,
    extractor: Extractor,
    scratch: ScratchRegion,
    progress: LoadProgress,
    addresses: FirmwareAddresses,
    matches: MatchState,
    /// Device reported the secure lock at the last load start.
    secured: bool,
    stats: SessionStats,
    last_error: Option<Error>,
}

impl<'b> DeviceSession<'b> {
    /// Probe the device id and build a session for the variant found.
    pub fn init(bus: &'b mut dyn BusTransport, mode: InitMode) -> Result<DeviceSession<'b>> {
        let chip;
        let mut host;
        let mut dsp = MailboxChannel::dsp();
        let mut scratch;
        let mut addresses = FirmwareAddresses::default();
        {
            let mut guard = BusGuard::new(&mut *bus)?;
            let bus = guard.bus();
            chip = probe(bus)?;
            log::info!("session opened on {}", chip.name());
            host = MailboxChannel::host(chip.exchange_origin());
            scratch = ScratchRegion::new(chip.scratch_origin());
            match mode {
                InitMode::Reset => {
                    write_word(bus, MemoryRegion::Mcu, CHIP_CONTROL, CTL_SOFT_RESET)?;
                    bus.sleep_microseconds(RESET_SETTLE_US);
                    // Scratch RAM is preserved across soft reset.
                    scratch.refresh(bus)?;
                }
                InitMode::Attach => {
                    scratch.refresh(bus)?;
                    match load::discover_mcu(bus, &mut host, &mut addresses)
                        .and_then(|_| load::discover_dsp(bus, &mut dsp, &mut addresses))
                    {
                        Ok(()) => {}
                        Err(Error::Timeout)
                        | Err(Error::ProtocolSequence)
                        | Err(Error::DeviceReported(_)) => {
                            log::info!("no running firmware to attach to");
                            addresses = FirmwareAddresses::default();
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
        Ok(DeviceSession {
            bus,
            chip,
            host,
            dsp,
            parser: PackageParser::new(),
            extractor: Extractor::new(),
            scratch,
            progress: LoadProgress::default(),
            addresses,
            matches: MatchState::default(),
            secured: false,
            stats: SessionStats::default(),
            last_error: None,
        })
    }

    /// Tear the session down. The device keeps running; a later `init`
    /// with [`InitMode::Attach`] picks it back up.
    pub fn uninit(self) {}

    pub fn chip(&self) -> &'static dyn ChipVariant {
        self.chip
    }

    pub fn addresses(&self) -> &FirmwareAddresses {
        &self.addresses
    }

    pub fn secured(&self) -> bool {
        self.secured
    }

    pub fn last_error(&self) -> Option<Error> {
        self.last_error
    }

    /// Apply one wait budget to both mailbox channels.
    pub fn set_wait_budget(&mut self, iterations: u32, interval_us: u32) {
        self.host.set_wait_budget(iterations, interval_us);
        self.dsp.set_wait_budget(iterations, interval_us);
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            host: *self.host.diagnostics(),
            dsp: *self.dsp.diagnostics(),
            extract: self.extractor.diagnostics(),
            records_parsed: self.parser.records_completed(),
            stats: self.stats,
        }
    }

    fn account<T>(&mut self, result: Result<T>) -> Result<T> {
        self.stats.operations += 1;
        if let Err(err) = &result {
            self.stats.failures += 1;
            self.last_error = Some(*err);
        }
        result
    }

    // -----------------------------------------------------------------
    // Package loading
    // -----------------------------------------------------------------

    /// Feed package bytes. Chunk boundaries are arbitrary. An empty
    /// chunk ends the package: the end-of-package checks run and the
    /// engine resets for the next one. An empty chunk before any bytes
    /// instead drops half-parsed state and the previous package's
    /// identity.
    pub fn load(&mut self, chunk: &[u8]) -> Result<()> {
        let result = self.load_inner(chunk);
        self.account(result)
    }

    fn load_inner(&mut self, chunk: &[u8]) -> Result<()> {
        let DeviceSession {
            bus,
            chip,
            host,
            dsp,
            parser,
            extractor,
            scratch,
            progress,
            addresses,
            matches,
            secured,
            stats,
            ..
        } = self;
        let mut guard = BusGuard::new(&mut **bus)?;
        let bus = guard.bus();

        if chunk.is_empty() {
            if !progress.started {
                parser.reset();
                *progress = LoadProgress::default();
                return Ok(());
            }
            let result = (|| {
                if progress.secure {
                    load::secure_finish(bus, host, dsp, addresses, progress)?;
                } else {
                    parser.finish()?;
                }
                validate_identity(*chip, progress.identity.as_ref())?;
                scratch.flush(bus)
            })();
            if result.is_ok() {
                stats.loads_completed += 1;
                log::info!(
                    "package load complete, {} records",
                    parser.records_completed()
                );
            }
            // Whatever ran before this load is gone either way.
            extractor.reset();
            *matches = MatchState::default();
            parser.reset();
            *progress = LoadProgress::default();
            return result;
        }

        if !progress.started {
            progress.started = true;
            let posture = read_word(bus, MemoryRegion::Mcu, SEC_STATUS)?;
            progress.secure = posture & SEC_LOCKED != 0;
            *secured = progress.secure;
            if progress.secure {
                log::info!("device is secured, streaming to the bootloader");
                *addresses = FirmwareAddresses::default();
                host.begin_resync();
            }
        }

        if progress.secure {
            load::secure_chunk(bus, host, *chip, progress, chunk)
        } else {
            let mut sink = DeviceSink {
                bus,
                host,
                dsp,
                chip: *chip,
                scratch,
                progress,
                addresses,
            };
            parser.feed(&mut sink, chunk)
        }
    }

    /// In secure mode, ask firmware to publish identity and version
    /// strings into the scratch region and re-read the shadow.
    pub fn secure_get_info(&mut self) -> Result<()> {
        let result = self.secure_get_info_inner();
        self.account(result)
    }

    fn secure_get_info_inner(&mut self) -> Result<()> {
        if !self.secured {
            return Err(Error::Unsupported);
        }
        let DeviceSession {
            bus, host, scratch, ..
        } = self;
        let mut guard = BusGuard::new(&mut **bus)?;
        let bus = guard.bus();
        host.extended(bus, ExtOp::SecureInfo.into(), [0, 0])?;
        scratch.verify(bus)
    }

    /// Re-read the scratch cache from the device.
    pub fn refresh_cache(&mut self) -> Result<()> {
        let DeviceSession { bus, scratch, .. } = self;
        let mut guard = BusGuard::new(&mut **bus)?;
        scratch.refresh(guard.bus())
    }

    // -----------------------------------------------------------------
    // Notifications and liveness
    // -----------------------------------------------------------------

    /// Read and optionally clear pending notifications, draining any
    /// device-initiated mailbox messages first. Call once per interrupt.
    pub fn poll(&mut self, clear: bool) -> Result<Notifications> {
        let result = self.poll_inner(clear);
        self.account(result)
    }

    fn poll_inner(&mut self, clear: bool) -> Result<Notifications> {
        let DeviceSession {
            bus,
            addresses,
            matches,
            stats,
            ..
        } = self;
        let state = addresses.mcu_state.ok_or(Error::Uninitialized)?;
        let mut guard = BusGuard::new(&mut **bus)?;
        let bus = guard.bus();

        while take_device_message(bus)?.is_some() {}

        let word = read_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_NOTIFICATIONS)?;
        if clear && word != 0 {
            write_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_NOTIFICATIONS, 0)?;
        }
        let notes = Notifications::from_bits(word);
        if !notes.is_empty() {
            stats.notifications_seen += 1;
        }
        if notes.contains(Notifications::MATCH) {
            stats.matches_seen += 1;
            refresh_matches(bus, state, matches)?;
        }
        Ok(notes)
    }

    /// Sample both liveness counters across `wait_us`. Returns a mask of
    /// [`FW_ALIVE_MCU`] and [`FW_ALIVE_DSP`].
    pub fn check_firmware(&mut self, wait_us: u32) -> Result<u32> {
        let result = self.check_firmware_inner(wait_us);
        self.account(result)
    }

    fn check_firmware_inner(&mut self, wait_us: u32) -> Result<u32> {
        let DeviceSession { bus, addresses, .. } = self;
        if addresses.mcu_state.is_none() && addresses.dsp_state.is_none() {
            return Err(Error::Uninitialized);
        }
        let mut guard = BusGuard::new(&mut **bus)?;
        let bus = guard.bus();

        let mcu_before = match addresses.mcu_state {
            Some(state) => Some(read_word(
                bus,
                MemoryRegion::Mcu,
                state + fw_state::MCU_HEARTBEAT,
            )?),
            None => None,
        };
        let dsp_before = match addresses.dsp_state {
            Some(state) => Some(read_word(
                bus,
                MemoryRegion::Dsp,
                state + fw_state::DSP_HEARTBEAT,
            )?),
            None => None,
        };
        bus.sleep_microseconds(wait_us);
        let mut alive = 0;
        if let (Some(state), Some(before)) = (addresses.mcu_state, mcu_before) {
            if read_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_HEARTBEAT)? != before {
                alive |= FW_ALIVE_MCU;
            }
        }
        if let (Some(state), Some(before)) = (addresses.dsp_state, dsp_before) {
            if read_word(bus, MemoryRegion::Dsp, state + fw_state::DSP_HEARTBEAT)? != before {
                alive |= FW_ALIVE_DSP;
            }
        }
        Ok(alive)
    }

    // -----------------------------------------------------------------
    // Match surface
    // -----------------------------------------------------------------

    /// True if `network` has produced a match the session has not yet
    /// consumed through `match_summary`.
    pub fn match_event_available(&self, network: u32) -> bool {
        let slot = network as usize;
        slot < MAX_NETWORKS && self.matches.producer[slot] != self.matches.consumer[slot]
    }

    /// Summary of the most recent match, consuming its freshness for the
    /// network that produced it.
    pub fn match_summary(&mut self) -> MatchSummary {
        let slot = self.matches.last_network as usize;
        if slot < MAX_NETWORKS {
            self.matches.consumer[slot] = self.matches.producer[slot];
        }
        MatchSummary(self.matches.summary)
    }

    /// Per-class hit bitmap of the most recent match.
    pub fn match_binary(&self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.matches.binary.len() {
            return Err(Error::Exhausted);
        }
        out.copy_from_slice(&self.matches.binary[..out.len()]);
        Ok(())
    }

    /// Read per-class strength bytes for the most recent match. Returns
    /// how many bytes were filled.
    pub fn match_strength(&mut self, out: &mut [u8], kind: MatchStrengthKind) -> Result<usize> {
        let result = self.match_strength_inner(out, kind);
        self.account(result)
    }

    fn match_strength_inner(&mut self, out: &mut [u8], kind: MatchStrengthKind) -> Result<usize> {
        let DeviceSession { bus, addresses, .. } = self;
        let state = addresses.mcu_state.ok_or(Error::Uninitialized)?;
        let offset = match kind {
            MatchStrengthKind::Raw => fw_state::MCU_STRENGTH_RAW,
            MatchStrengthKind::Softmax => fw_state::MCU_STRENGTH_SOFTMAX,
        };
        let take = out.len().min(MAX_CLASSES as usize);
        let mut guard = BusGuard::new(&mut **bus)?;
        guard
            .bus()
            .read(MemoryRegion::Mcu, state + offset, &mut out[..take])?;
        Ok(take)
    }

    // -----------------------------------------------------------------
    // Extraction
    // -----------------------------------------------------------------

    /// Drain one capture stream into `out` per `policy`. Returns bytes
    /// written, always a whole number of elements.
    pub fn extract(
        &mut self,
        kind: StreamKind,
        policy: ExtractPolicy,
        out: &mut [u8],
    ) -> Result<usize> {
        let result = self.extract_inner(kind, policy, out);
        self.account(result)
    }

    fn extract_inner(
        &mut self,
        kind: StreamKind,
        policy: ExtractPolicy,
        out: &mut [u8],
    ) -> Result<usize> {
        let DeviceSession {
            bus,
            addresses,
            extractor,
            ..
        } = self;
        let dsp_state = addresses.dsp_state.ok_or(Error::Uninitialized)?;
        let mut guard = BusGuard::new(&mut **bus)?;
        let bus = guard.bus();
        let tank = tank_addr(dsp_state, kind);
        let ring = read_tank(bus, tank)?;
        let written = extractor.extract(bus, &ring, kind, policy, out)?;
        if ring.sample_reset {
            // Acknowledge the restart so the next pass saturates against
            // live pointers again.
            write_word(bus, MemoryRegion::Dsp, tank + fw_state::TANK_FLAGS, 0)?;
        }
        Ok(written)
    }

    /// Audio leading up to the most recent match: extraction ends at the
    /// tank pointer captured when the match fired.
    pub fn extract_at_last_match(&mut self, out: &mut [u8]) -> Result<usize> {
        let end = self.matches.tank_ptr;
        self.extract(StreamKind::Audio, ExtractPolicy::AtMatch { end }, out)
    }

    // -----------------------------------------------------------------
    // Peripheral bridge
    // -----------------------------------------------------------------

    /// Run one transaction against a sensor-bus peripheral through the
    /// signal-processor serial engine.
    pub fn serial_transfer(
        &mut self,
        target: SerialTarget,
        out: &[u8],
        input: &mut [u8],
        hold: bool,
    ) -> Result<()> {
        let result = self.serial_transfer_inner(target, out, input, hold);
        self.account(result)
    }

    fn serial_transfer_inner(
        &mut self,
        target: SerialTarget,
        out: &[u8],
        input: &mut [u8],
        hold: bool,
    ) -> Result<()> {
        let DeviceSession {
            bus,
            dsp,
            chip,
            addresses,
            ..
        } = self;
        let dsp_state = addresses.dsp_state.ok_or(Error::Uninitialized)?;
        let encoded = serial::encode_target(target, u32::from(chip.gpio_count()))?;
        let mut guard = BusGuard::new(&mut **bus)?;
        serial::transfer(
            guard.bus(),
            dsp,
            dsp_state + fw_state::DSP_SERIAL_WINDOW,
            encoded,
            out,
            input,
            hold,
        )
    }

    // -----------------------------------------------------------------
    // Configuration
    // -----------------------------------------------------------------

    /// Switch the PLL to `config::CLOCK_PRESETS[index]`.
    pub fn apply_clock_preset(&mut self, index: usize) -> Result<()> {
        let result = {
            let DeviceSession {
                bus, host, scratch, ..
            } = self;
            match BusGuard::new(&mut **bus) {
                Ok(mut guard) => config::apply_clock_preset(guard.bus(), host, scratch, index),
                Err(err) => Err(err.into()),
            }
        };
        self.account(result)
    }

    pub fn clock_preset(&self) -> Option<u32> {
        self.scratch.clock_preset()
    }

    /// Set the firmware liveness beat period; zero disables it.
    pub fn set_heartbeat_interval(&mut self, interval_ms: u32) -> Result<()> {
        let result = {
            let DeviceSession {
                bus, host, scratch, ..
            } = self;
            match BusGuard::new(&mut **bus) {
                Ok(mut guard) => {
                    config::set_heartbeat_interval(guard.bus(), host, scratch, interval_ms)
                }
                Err(err) => Err(err.into()),
            }
        };
        self.account(result)
    }

    pub fn heartbeat_interval_ms(&self) -> Option<u32> {
        self.scratch.heartbeat_interval_ms()
    }

    pub fn set_input_source(&mut self, source: InputSource) -> Result<()> {
        let result = {
            let DeviceSession { bus, host, .. } = self;
            match BusGuard::new(&mut **bus) {
                Ok(mut guard) => config::set_input_source(guard.bus(), host, source),
                Err(err) => Err(err.into()),
            }
        };
        self.account(result)
    }

    /// Enable or disable the posterior handler. The handler state always
    /// restarts, so expect match counters to begin again from zero.
    pub fn set_posterior_enable(&mut self, enable: bool, match_per_frame: bool) -> Result<()> {
        let result = {
            let DeviceSession { bus, host, .. } = self;
            match BusGuard::new(&mut **bus) {
                Ok(mut guard) => {
                    config::set_posterior_enable(guard.bus(), host, enable, match_per_frame)
                }
                Err(err) => Err(err.into()),
            }
        };
        self.account(result)
    }

    /// Store a sensor record and have firmware apply it.
    pub fn apply_sensor(&mut self, slot: usize, record: &SensorRecord) -> Result<()> {
        let result = {
            let DeviceSession {
                bus,
                host,
                scratch,
                chip,
                ..
            } = self;
            let slots = chip.sensor_slots();
            match BusGuard::new(&mut **bus) {
                Ok(mut guard) => {
                    config::apply_sensor(guard.bus(), host, scratch, slot, slots, record)
                }
                Err(err) => Err(err.into()),
            }
        };
        self.account(result)
    }

    pub fn sensor(&self, slot: usize) -> Option<SensorRecord> {
        self.scratch.sensor(slot)
    }

    // -----------------------------------------------------------------
    // Cached identity and versions
    // -----------------------------------------------------------------

    /// Package interface identity from the scratch cache.
    pub fn identity(&self) -> Option<InterfaceVersion> {
        self.scratch.identity()
    }

    /// Cached version string; never touches the device.
    pub fn version(&self, kind: StringKind) -> Option<&str> {
        self.scratch.version(kind)
    }

    /// Cached class label by flat index across networks.
    pub fn label(&self, index: u32) -> Option<&str> {
        self.scratch.label(index)
    }
}

fn tank_addr(dsp_state: u32, kind: StreamKind) -> u32 {
    let slot = match kind {
        StreamKind::Audio => 0,
        StreamKind::Feature => 1,
        StreamKind::Sensor => 2,
        StreamKind::Accelerometer => 3,
    };
    dsp_state + fw_state::DSP_TANKS + slot * fw_state::TANK_STRIDE
}

/// Decode one tank descriptor out of the DSP state block.
fn read_tank(bus: &mut dyn BusTransport, tank: u32) -> Result<RingDescriptor> {
    let mut raw = [0u8; fw_state::TANK_STRIDE as usize];
    bus.read(MemoryRegion::Dsp, tank, &mut raw)?;
    let word = |offset: u32| {
        let at = offset as usize;
        u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
    };
    let annotation = word(fw_state::TANK_ANNOTATION);
    Ok(RingDescriptor {
        region: MemoryRegion::Dsp,
        base: word(fw_state::TANK_BASE),
        size: word(fw_state::TANK_SIZE),
        stride: word(fw_state::TANK_SAMPLE),
        producer: word(fw_state::TANK_PRODUCER),
        consumer: word(fw_state::TANK_CONSUMER),
        annotation_base: if annotation == 0 {
            None
        } else {
            Some(annotation)
        },
        sample_reset: word(fw_state::TANK_FLAGS) & fw_state::TANK_FLAG_SAMPLE_RESET != 0,
    })
}

fn refresh_matches(
    bus: &mut dyn BusTransport,
    state: u32,
    matches: &mut MatchState,
) -> Result<()> {
    matches.last_network = read_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_LAST_NETWORK)?;
    matches.summary = read_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_MATCH_SUMMARY)?;
    matches.tank_ptr = read_word(bus, MemoryRegion::Mcu, state + fw_state::MCU_MATCH_TANK_PTR)?;
    bus.read(
        MemoryRegion::Mcu,
        state + fw_state::MCU_MATCH_BINARY,
        &mut matches.binary,
    )?;
    let mut counters = [0u8; MAX_NETWORKS * 4];
    bus.read(
        MemoryRegion::Mcu,
        state + fw_state::MCU_MATCH_PRODUCER,
        &mut counters,
    )?;
    for (slot, chunk) in counters.chunks_exact(4).enumerate() {
        matches.producer[slot] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    log::debug!(
        "match on network {} summary 0x{:08x}",
        matches.last_network,
        matches.summary
    );
    Ok(())
}
