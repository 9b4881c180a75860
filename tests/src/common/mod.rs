// Licensed under the Apache-2.0 license

//! Shared infrastructure for the integration tests.
//!
//! [`MockBus`] implements the transport trait over an in-process device
//! model: the register file, both mailbox channels with toggled sequence
//! bits, the extended-op exchange area, a software serial engine, and two
//! sparse RAM maps holding the firmware state blocks, load windows and
//! the scratch region. The model lives behind `Rc<RefCell<..>>` so a test
//! can stage device state and inspect the observation logs while a
//! session still holds the bus borrow.
//!
//! [`PackageBuilder`] assembles tag-length-value package images, and
//! [`scratch_image`] produces checksummed scratch snapshots the way
//! device firmware would publish them.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use aoncore_bus::{BusResult, BusTransport, MemoryRegion};
use aoncore_driver::chip::{variant_for_device_id, ChipType, DEVICE_ID_ADDR};
use aoncore_driver::load::{
    BOOT_RUNNING, CHIP_CONTROL, CTL_DSP_HALT, CTL_MCU_HALT, CTL_SOFT_RESET, SEC_LOCKED, SEC_STATUS,
};
use aoncore_driver::mailbox::{
    ExtOp, Opcode, INT_DEVICE_OUT, INT_DSP_RESPONSE, INT_HOST_RESPONSE, MBOX_DEVICE_OUT,
    MBOX_DEVICE_OUT_ACK, MBOX_DSP_REQUEST, MBOX_DSP_RESPONSE, MBOX_HOST_REQUEST,
    MBOX_HOST_RESPONSE, MBOX_INT_STATUS, PAYLOAD_MASK, TOGGLE_BIT,
};
use aoncore_driver::package::{InterfaceVersion, Tag, MAGIC_VALUE};
use aoncore_driver::scratch::{ScratchRegion, SCRATCH_LEN};
use aoncore_driver::session::fw_state;
use zerocopy::IntoBytes;

/// Fixed addresses the emulated firmware publishes its state blocks at.
/// All of them are plain RAM to the model; the driver learns them through
/// the mailbox address exchange.
pub mod layout {
    pub const MCU_STATE_ADDR: u32 = 0x2001_a000;
    pub const GRAPH_ADDR: u32 = 0x2001_b000;
    pub const DNN_ADDR: u32 = 0x2001_c000;
    pub const DEBUG_ADDR: u32 = 0x2001_d000;
    pub const DSP_STATE_ADDR: u32 = 0x3001_0000;
    /// DSP RAM used for capture tanks staged by extraction tests.
    pub const TANK_RAM: u32 = 0x3004_0000;
}

/// An AON210 device id.
pub const DEFAULT_DEVICE_ID: u8 = 0x30;

// Response payloads on the wire.
const RSP_SUCCESS: u8 = 0x00;
const RSP_CONT: u8 = 0x01;
const RSP_ERROR: u8 = 0x02;
const RSP_DATA: u8 = 0x40;

const ADDRESS_CHUNKS: usize = 5;

// Serial-engine control word, re-derived here so the model checks the
// driver's encoding rather than reusing it.
const SERIAL_RUN: u32 = 1 << 19;
const SERIAL_CONT: u32 = 1 << 8;

/// Extended ops whose payload arrives staged in the open RAM window.
const STAGED_OPS: &[ExtOp] = &[
    ExtOp::ApplyConfig,
    ExtOp::PosteriorBegin,
    ExtOp::PosteriorState,
    ExtOp::PosteriorClass,
    ExtOp::FrontEndBegin,
    ExtOp::FrontEndBoundaries,
    ExtOp::FlowRule,
];

/// One completed extended op: the code, the request payload words, and
/// the blob that was staged for it (empty for non-staged ops).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtEvent {
    pub op: u32,
    pub request: [u32; 2],
    pub blob: Vec<u8>,
}

impl ExtEvent {
    pub fn is(&self, op: ExtOp) -> bool {
        self.op == u32::from(op)
    }
}

/// Capture-tank descriptor as staged into the DSP state block.
#[derive(Debug, Clone, Copy, Default)]
pub struct TankSpec {
    pub base: u32,
    pub size: u32,
    pub stride: u32,
    pub producer: u32,
    pub consumer: u32,
    pub annotation: u32,
    pub flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Burst {
    Idle,
    /// Serving a 30-bit address, six bits per CONTINUE exchange.
    Address { value: u32, chunk: usize },
}

struct Responder {
    burst: Burst,
    response: u8,
}

impl Responder {
    fn new() -> Self {
        Responder {
            burst: Burst::Idle,
            response: 0,
        }
    }
}

/// The emulated coprocessor.
pub struct DeviceModel {
    pub device_id: u8,
    pub sec_locked: bool,
    /// Control firmware (or, when `sec_locked`, the bootloader) answers
    /// the host mailbox.
    pub mcu_alive: bool,
    pub dsp_alive: bool,
    /// Image copied over the scratch region when a `SecureInfo` op runs.
    pub secure_info_image: Option<Vec<u8>>,
    /// Force the exchange status word for one extended op code.
    pub ext_fail: Option<(u32, u32)>,
    /// Completion status the serial engine reports for every window.
    pub serial_report: u32,
    /// Leave the serial run bit set, as a wedged engine would.
    pub serial_stuck: bool,

    chip_control: u32,
    int_status: u8,
    host: Responder,
    dsp: Responder,
    exchange_origin: u32,
    scratch_origin: u32,
    open_ram_base: u32,
    serial_fill: u8,
    mcu_ram: BTreeMap<u32, u8>,
    dsp_ram: BTreeMap<u32, u8>,
    device_out: VecDeque<u8>,

    // Observation logs.
    pub ext_log: Vec<ExtEvent>,
    pub prepare_count: u32,
    pub host_nops: u32,
    pub resets: u32,
    pub acks: Vec<u8>,
    pub secure_stream: Vec<u8>,
    /// `(address byte, continue, out bytes)` per serial window consumed.
    pub serial_windows: Vec<(u8, bool, Vec<u8>)>,
    /// `(region, address, length)` for every plain RAM write the driver
    /// issued. Register writes and the model's own stores are not logged.
    pub ram_writes: Vec<(MemoryRegion, u32, u32)>,
    pub acquires: u32,
    pub releases: u32,
}

impl DeviceModel {
    fn new(device_id: u8) -> Self {
        let chip = variant_for_device_id(device_id)
            .or_else(|| variant_for_device_id(DEFAULT_DEVICE_ID))
            .unwrap();
        let mut model = DeviceModel {
            device_id,
            sec_locked: false,
            mcu_alive: false,
            dsp_alive: false,
            secure_info_image: None,
            ext_fail: None,
            serial_report: 0,
            serial_stuck: false,
            chip_control: 0,
            int_status: 0,
            host: Responder::new(),
            dsp: Responder::new(),
            exchange_origin: chip.exchange_origin(),
            scratch_origin: chip.scratch_origin(),
            open_ram_base: chip.open_ram().base,
            serial_fill: 0,
            mcu_ram: BTreeMap::new(),
            dsp_ram: BTreeMap::new(),
            device_out: VecDeque::new(),
            ext_log: Vec::new(),
            prepare_count: 0,
            host_nops: 0,
            resets: 0,
            acks: Vec::new(),
            secure_stream: Vec::new(),
            serial_windows: Vec::new(),
            ram_writes: Vec::new(),
            acquires: 0,
            releases: 0,
        };
        // State-block pointers the control firmware would publish.
        model.set_word(
            MemoryRegion::Mcu,
            layout::MCU_STATE_ADDR + fw_state::MCU_GRAPH_PTR,
            layout::GRAPH_ADDR,
        );
        model.set_word(
            MemoryRegion::Mcu,
            layout::MCU_STATE_ADDR + fw_state::MCU_DNN_PTR,
            layout::DNN_ADDR,
        );
        model.set_word(
            MemoryRegion::Mcu,
            layout::MCU_STATE_ADDR + fw_state::MCU_DEBUG_PTR,
            layout::DEBUG_ADDR,
        );
        model
    }

    pub fn scratch_origin(&self) -> u32 {
        self.scratch_origin
    }

    // -- memory helpers -----------------------------------------------------

    pub fn word(&self, region: MemoryRegion, address: u32) -> u32 {
        let raw = self.bytes(region, address, 4);
        u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])
    }

    pub fn set_word(&mut self, region: MemoryRegion, address: u32, value: u32) {
        self.store(region, address, &value.to_le_bytes());
    }

    pub fn fill(&mut self, region: MemoryRegion, address: u32, bytes: &[u8]) {
        self.store(region, address, bytes);
    }

    pub fn bytes(&self, region: MemoryRegion, address: u32, len: usize) -> Vec<u8> {
        let map = self.ram(region);
        (0..len)
            .map(|slot| map.get(&(address + slot as u32)).copied().unwrap_or(0))
            .collect()
    }

    fn ram(&self, region: MemoryRegion) -> &BTreeMap<u32, u8> {
        match region {
            MemoryRegion::Mcu => &self.mcu_ram,
            MemoryRegion::Dsp => &self.dsp_ram,
        }
    }

    fn store(&mut self, region: MemoryRegion, address: u32, bytes: &[u8]) {
        let map = match region {
            MemoryRegion::Mcu => &mut self.mcu_ram,
            MemoryRegion::Dsp => &mut self.dsp_ram,
        };
        for (slot, byte) in bytes.iter().enumerate() {
            map.insert(address + slot as u32, *byte);
        }
    }

    // -- staging helpers ----------------------------------------------------

    pub fn install_scratch(&mut self, image: &[u8]) {
        let origin = self.scratch_origin;
        self.store(MemoryRegion::Mcu, origin, image);
    }

    pub fn install_tank(&mut self, slot: u32, spec: &TankSpec) {
        let tank = layout::DSP_STATE_ADDR + fw_state::DSP_TANKS + slot * fw_state::TANK_STRIDE;
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_BASE, spec.base);
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_SIZE, spec.size);
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_SAMPLE, spec.stride);
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_PRODUCER, spec.producer);
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_CONSUMER, spec.consumer);
        self.set_word(
            MemoryRegion::Dsp,
            tank + fw_state::TANK_ANNOTATION,
            spec.annotation,
        );
        self.set_word(MemoryRegion::Dsp, tank + fw_state::TANK_FLAGS, spec.flags);
    }

    pub fn tank_addr(slot: u32) -> u32 {
        layout::DSP_STATE_ADDR + fw_state::DSP_TANKS + slot * fw_state::TANK_STRIDE
    }

    pub fn push_device_message(&mut self, byte: u8) {
        self.device_out.push_back(byte);
    }

    pub fn raise_notifications(&mut self, bits: u32) {
        let address = layout::MCU_STATE_ADDR + fw_state::MCU_NOTIFICATIONS;
        let current = self.word(MemoryRegion::Mcu, address);
        self.set_word(MemoryRegion::Mcu, address, current | bits);
    }

    /// Every extended op matching `op`, in arrival order.
    pub fn ops(&self, op: ExtOp) -> Vec<ExtEvent> {
        self.ext_log
            .iter()
            .filter(|event| event.is(op))
            .cloned()
            .collect()
    }

    // -- device behavior ----------------------------------------------------

    fn int_status_byte(&self) -> u8 {
        let mut value = self.int_status;
        if !self.device_out.is_empty() {
            value |= INT_DEVICE_OUT;
        }
        value
    }

    fn tick(&mut self) {
        if self.mcu_alive {
            let address = layout::MCU_STATE_ADDR + fw_state::MCU_HEARTBEAT;
            let beat = self.word(MemoryRegion::Mcu, address).wrapping_add(1);
            self.set_word(MemoryRegion::Mcu, address, beat);
        }
        if self.dsp_alive {
            let address = layout::DSP_STATE_ADDR + fw_state::DSP_HEARTBEAT;
            let beat = self.word(MemoryRegion::Dsp, address).wrapping_add(1);
            self.set_word(MemoryRegion::Dsp, address, beat);
        }
    }

    fn write_chip_control(&mut self, value: u32) {
        if value & CTL_SOFT_RESET != 0 {
            self.resets += 1;
            self.chip_control = 0;
            self.int_status = 0;
            self.host = Responder::new();
            self.dsp = Responder::new();
            self.device_out.clear();
            self.mcu_alive = false;
            self.dsp_alive = false;
            return;
        }
        let was = self.chip_control;
        self.chip_control = value;
        if value & CTL_MCU_HALT != 0 {
            self.mcu_alive = false;
        } else if was & CTL_MCU_HALT != 0 {
            // Coming out of halt boots whatever sits in the load window.
            self.mcu_alive = true;
        }
        if value & CTL_DSP_HALT != 0 {
            self.dsp_alive = false;
        } else if was & CTL_DSP_HALT != 0 {
            self.dsp_alive = true;
        }
    }

    fn address_reply(burst: &mut Burst) -> u8 {
        match *burst {
            Burst::Address { value, chunk } => {
                let bits = ((value >> (6 * chunk as u32)) & 0x3f) as u8;
                *burst = if chunk + 1 == ADDRESS_CHUNKS {
                    Burst::Idle
                } else {
                    Burst::Address {
                        value,
                        chunk: chunk + 1,
                    }
                };
                RSP_DATA | bits
            }
            Burst::Idle => RSP_ERROR,
        }
    }

    fn host_request(&mut self, request: u8) {
        if !(self.sec_locked || self.mcu_alive) {
            return;
        }
        let payload = request & PAYLOAD_MASK;
        let reply = if self.host.burst != Burst::Idle {
            if payload == u8::from(Opcode::Cont) {
                Self::address_reply(&mut self.host.burst)
            } else {
                self.host.burst = Burst::Idle;
                RSP_ERROR
            }
        } else if payload == u8::from(Opcode::Nop) {
            self.host_nops += 1;
            RSP_SUCCESS
        } else if payload == u8::from(Opcode::Prepare) {
            self.prepare_count += 1;
            RSP_SUCCESS
        } else if payload == u8::from(Opcode::Extended) {
            self.run_extended();
            RSP_SUCCESS
        } else if payload == u8::from(Opcode::StateAddr) {
            self.host.burst = Burst::Address {
                value: layout::MCU_STATE_ADDR,
                chunk: 0,
            };
            RSP_CONT
        } else {
            RSP_ERROR
        };
        self.host.response = reply | (request & TOGGLE_BIT);
        self.int_status |= INT_HOST_RESPONSE;
    }

    fn dsp_request(&mut self, request: u8) {
        if !self.dsp_alive {
            return;
        }
        let payload = request & PAYLOAD_MASK;
        let reply = if self.dsp.burst != Burst::Idle {
            if payload == u8::from(Opcode::Cont) {
                Self::address_reply(&mut self.dsp.burst)
            } else {
                self.dsp.burst = Burst::Idle;
                RSP_ERROR
            }
        } else if payload == u8::from(Opcode::Nop) {
            // The doorbell also kicks the serial engine.
            self.run_serial_engine();
            RSP_SUCCESS
        } else if payload == u8::from(Opcode::StateAddr) {
            self.dsp.burst = Burst::Address {
                value: layout::DSP_STATE_ADDR,
                chunk: 0,
            };
            RSP_CONT
        } else {
            RSP_ERROR
        };
        self.dsp.response = reply | (request & TOGGLE_BIT);
        self.int_status |= INT_DSP_RESPONSE;
    }

    fn run_extended(&mut self) {
        let origin = self.exchange_origin;
        let op = self.word(MemoryRegion::Mcu, origin);
        let request = [
            self.word(MemoryRegion::Mcu, origin + 8),
            self.word(MemoryRegion::Mcu, origin + 12),
        ];
        let mut status = 0u32;
        if let Some((fail_op, code)) = self.ext_fail {
            if fail_op == op {
                status = code;
            }
        }
        let mut result = [0u32; 2];
        let mut blob = Vec::new();
        if status == 0 {
            if op == u32::from(ExtOp::BootStatus) {
                result[0] = BOOT_RUNNING;
            } else if op == u32::from(ExtOp::SecureWindow) {
                blob = self.bytes(MemoryRegion::Mcu, self.open_ram_base, request[1] as usize);
                let offset = request[0] as usize;
                if self.secure_stream.len() < offset + blob.len() {
                    self.secure_stream.resize(offset + blob.len(), 0);
                }
                self.secure_stream[offset..offset + blob.len()].copy_from_slice(&blob);
            } else if op == u32::from(ExtOp::SecureDone) {
                // The bootloader validated the stream and boots both cores.
                self.mcu_alive = true;
                self.dsp_alive = true;
            } else if op == u32::from(ExtOp::SecureInfo) {
                if let Some(image) = self.secure_info_image.clone() {
                    let scratch = self.scratch_origin;
                    self.store(MemoryRegion::Mcu, scratch, &image);
                }
            } else if STAGED_OPS.iter().any(|&staged| op == u32::from(staged)) {
                blob = self.bytes(MemoryRegion::Mcu, self.open_ram_base, request[1] as usize);
            }
        }
        self.ext_log.push(ExtEvent { op, request, blob });
        self.set_word(MemoryRegion::Mcu, origin + 4, status);
        self.set_word(MemoryRegion::Mcu, origin + 8, result[0]);
        self.set_word(MemoryRegion::Mcu, origin + 12, result[1]);
    }

    fn run_serial_engine(&mut self) {
        let window = layout::DSP_STATE_ADDR + fw_state::DSP_SERIAL_WINDOW;
        let mut control = self.word(MemoryRegion::Dsp, window);
        if control & SERIAL_RUN == 0 {
            return;
        }
        let address = (control & 0xff) as u8;
        let cont = control & SERIAL_CONT != 0;
        let out_len = ((control >> 9) & 0x1f) as usize;
        let in_len = ((control >> 14) & 0x1f) as u32;
        let out = self.bytes(MemoryRegion::Dsp, window + 4, out_len);
        self.serial_windows.push((address, cont, out));
        for slot in 0..in_len {
            let byte = self.serial_fill;
            self.serial_fill = self.serial_fill.wrapping_add(1);
            self.store(MemoryRegion::Dsp, window + 4 + slot, &[byte]);
        }
        if !self.serial_stuck {
            control &= !SERIAL_RUN;
            control |= (self.serial_report & 0x3) << 20;
            let raw = control.to_le_bytes();
            self.store(MemoryRegion::Dsp, window, &raw);
        }
    }

    fn bus_read(&mut self, region: MemoryRegion, address: u32, buffer: &mut [u8]) {
        match (region, address) {
            (MemoryRegion::Mcu, CHIP_CONTROL) if buffer.len() == 4 => {
                buffer.copy_from_slice(&self.chip_control.to_le_bytes());
            }
            (MemoryRegion::Mcu, DEVICE_ID_ADDR) => buffer[0] = self.device_id,
            (MemoryRegion::Mcu, SEC_STATUS) if buffer.len() == 4 => {
                let value = if self.sec_locked { SEC_LOCKED } else { 0 };
                buffer.copy_from_slice(&value.to_le_bytes());
            }
            (MemoryRegion::Mcu, MBOX_INT_STATUS) => buffer[0] = self.int_status_byte(),
            (MemoryRegion::Mcu, MBOX_HOST_RESPONSE) => buffer[0] = self.host.response,
            (MemoryRegion::Mcu, MBOX_DEVICE_OUT) => {
                buffer[0] = self.device_out.front().copied().unwrap_or(0)
            }
            (MemoryRegion::Dsp, MBOX_DSP_RESPONSE) => buffer[0] = self.dsp.response,
            _ => {
                let map = self.ram(region);
                for (slot, byte) in buffer.iter_mut().enumerate() {
                    *byte = map.get(&(address + slot as u32)).copied().unwrap_or(0);
                }
            }
        }
    }

    fn bus_write(&mut self, region: MemoryRegion, address: u32, buffer: &[u8]) {
        match (region, address) {
            (MemoryRegion::Mcu, CHIP_CONTROL) if buffer.len() == 4 => {
                let value = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
                self.write_chip_control(value);
            }
            (MemoryRegion::Mcu, MBOX_HOST_REQUEST) => self.host_request(buffer[0]),
            (MemoryRegion::Mcu, MBOX_INT_STATUS) => self.int_status &= !buffer[0],
            (MemoryRegion::Mcu, MBOX_DEVICE_OUT_ACK) => {
                self.acks.push(buffer[0]);
                self.device_out.pop_front();
            }
            (MemoryRegion::Dsp, MBOX_DSP_REQUEST) => self.dsp_request(buffer[0]),
            _ => {
                self.ram_writes.push((region, address, buffer.len() as u32));
                self.store(region, address, buffer);
            }
        }
    }
}

/// Transport over the device model. Clone the model handle before handing
/// the bus to a session; the session owns the only `&mut`.
pub struct MockBus {
    model: Rc<RefCell<DeviceModel>>,
}

impl MockBus {
    pub fn new(device_id: u8) -> Self {
        MockBus {
            model: Rc::new(RefCell::new(DeviceModel::new(device_id))),
        }
    }

    /// A device with firmware already up on both cores.
    pub fn running(device_id: u8) -> Self {
        let bus = MockBus::new(device_id);
        {
            let mut model = bus.model.borrow_mut();
            model.mcu_alive = true;
            model.dsp_alive = true;
        }
        bus
    }

    pub fn model(&self) -> Rc<RefCell<DeviceModel>> {
        Rc::clone(&self.model)
    }
}

impl BusTransport for MockBus {
    fn read(&mut self, region: MemoryRegion, address: u32, buffer: &mut [u8]) -> BusResult<()> {
        self.model.borrow_mut().bus_read(region, address, buffer);
        Ok(())
    }

    fn write(&mut self, region: MemoryRegion, address: u32, buffer: &[u8]) -> BusResult<()> {
        self.model.borrow_mut().bus_write(region, address, buffer);
        Ok(())
    }

    fn acquire(&mut self) -> BusResult<()> {
        self.model.borrow_mut().acquires += 1;
        Ok(())
    }

    fn release(&mut self) -> BusResult<()> {
        self.model.borrow_mut().releases += 1;
        Ok(())
    }

    fn wait_for_mailbox_signal(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn sleep_microseconds(&mut self, _us: u32) {
        self.model.borrow_mut().tick();
    }
}

// ---------------------------------------------------------------------------
// Package images
// ---------------------------------------------------------------------------

/// Incremental package-image builder. Records are appended in call order;
/// [`PackageBuilder::build_sealed`] closes the image with a checksum
/// record over everything up to and including the checksum header.
pub struct PackageBuilder {
    bytes: Vec<u8>,
}

impl Default for PackageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageBuilder {
    /// Starts with the magic record.
    pub fn new() -> Self {
        let mut builder = PackageBuilder { bytes: Vec::new() };
        builder.record(Tag::Magic, &MAGIC_VALUE.to_le_bytes());
        builder
    }

    pub fn record(&mut self, tag: Tag, value: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(&u32::from(tag).to_le_bytes());
        self.bytes.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(value);
        self
    }

    pub fn identity(&mut self, chip: ChipType, major: u32, minor: u32) -> &mut Self {
        let identity = InterfaceVersion {
            chip_type: u32::from(u8::from(chip)),
            major,
            minor,
            patch: 0,
        };
        self.record(Tag::InterfaceVersion, identity.as_bytes())
    }

    /// Network metadata with formulaic layer values, see [`layer_input_size`]
    /// and [`layer_coord`]. One `(layer_count, cached)` pair per network.
    pub fn nn_metadata(&mut self, networks: &[(u32, bool)]) -> &mut Self {
        let mut value = Vec::new();
        value.extend_from_slice(&(networks.len() as u32).to_le_bytes());
        for (network, (layers, cached)) in networks.iter().enumerate() {
            value.extend_from_slice(&layers.to_le_bytes());
            value.extend_from_slice(&u32::from(*cached).to_le_bytes());
            for layer in 0..*layers {
                value.extend_from_slice(&layer_input_size(network as u32, layer).to_le_bytes());
                value.extend_from_slice(&layer_coord(network as u32, layer, 0).to_le_bytes());
                value.extend_from_slice(&layer_coord(network as u32, layer, 1).to_le_bytes());
                if *cached {
                    value.extend_from_slice(&[0u8; 16]);
                }
            }
        }
        self.record(Tag::NnMetadata, &value)
    }

    /// Filter-bank record: header, `filters + 1` boundary entries of
    /// `3 * index`, pad when the count requires it.
    pub fn front_end(&mut self, filters: u32) -> &mut Self {
        let mut value = Vec::new();
        value.extend_from_slice(&filters.to_le_bytes());
        value.extend_from_slice(&16_000u32.to_le_bytes());
        value.extend_from_slice(&0u32.to_le_bytes());
        for entry in 0..=filters {
            value.extend_from_slice(&((entry as u16) * 3).to_le_bytes());
        }
        if filters % 2 == 0 {
            value.extend_from_slice(&[0u8; 2]);
        }
        self.record(Tag::FrontEndV3, &value)
    }

    /// Bytes appended so far; used to split a feed at a record boundary.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn build_sealed(&self) -> Vec<u8> {
        let mut package = self.bytes.clone();
        package.extend_from_slice(&u32::from(Tag::Checksum).to_le_bytes());
        package.extend_from_slice(&4u32.to_le_bytes());
        let checksum = crc32fast::hash(&package);
        package.extend_from_slice(&checksum.to_le_bytes());
        package
    }
}

pub fn layer_input_size(network: u32, layer: u32) -> u32 {
    320 + (network << 8) + layer
}

pub fn layer_coord(network: u32, layer: u32, side: u32) -> u32 {
    0x1100 + (network << 8) + (layer << 4) + side
}

/// Deterministic image payload.
pub fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Feed a byte stream to `load` in `chunk`-sized pieces, then finalize
/// with the empty chunk.
pub fn feed_chunks(
    session: &mut aoncore_driver::DeviceSession<'_>,
    package: &[u8],
    chunk: usize,
) -> aoncore_driver::Result<()> {
    for piece in package.chunks(chunk) {
        session.load(piece)?;
    }
    session.load(&[])
}

// ---------------------------------------------------------------------------
// Scratch images
// ---------------------------------------------------------------------------

/// Capture sink for producing raw scratch snapshots.
struct CaptureBus {
    image: Vec<u8>,
}

impl BusTransport for CaptureBus {
    fn read(&mut self, _region: MemoryRegion, address: u32, buffer: &mut [u8]) -> BusResult<()> {
        let start = address as usize;
        buffer.copy_from_slice(&self.image[start..start + buffer.len()]);
        Ok(())
    }

    fn write(&mut self, _region: MemoryRegion, address: u32, buffer: &[u8]) -> BusResult<()> {
        let start = address as usize;
        self.image[start..start + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn acquire(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn release(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn wait_for_mailbox_signal(&mut self) -> BusResult<()> {
        Ok(())
    }

    fn sleep_microseconds(&mut self, _us: u32) {}
}

/// Build a checksummed scratch image the way firmware publishes one.
pub fn scratch_image<F: FnOnce(&mut ScratchRegion)>(fill: F) -> Vec<u8> {
    let mut shadow = ScratchRegion::new(0);
    fill(&mut shadow);
    let mut capture = CaptureBus {
        image: vec![0; SCRATCH_LEN],
    };
    shadow
        .flush(&mut capture)
        .expect("capture sink cannot fail");
    capture.image
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
