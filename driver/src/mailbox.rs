// Licensed under the Apache-2.0 license

//! Mailbox protocol
//!
//! Single-byte command/response channel to the coprocessor firmware. Each
//! direction carries a 7-bit payload plus an alternating sequence bit; a
//! request is acknowledged only by a response whose sequence bit matches
//! the expected toggle, except immediately after `begin_resync` where the
//! first response is accepted unconditionally and seeds the toggle.
//!
//! Two channels exist: the host channel to the control MCU and a doorbell
//! channel to the signal processor. Response readiness is signalled
//! through the interrupt-status register; waiting is a bounded poll loop
//! with the platform's mailbox signal as a fast path.
//!
//! 32-bit values cross the byte channel six bits at a time: address reads
//! pull five `CONT` responses (least-significant chunk first), word writes
//! push five data requests the same way. Anything larger goes through the
//! 16-byte exchange area plus the `EXTENDED` primitive.

use crate::error::{Error, Result};
use aoncore_bus::{read_word, BusTransport, MemoryRegion};
use bitfield::bitfield;
use num_enum::IntoPrimitive;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Host-to-MCU request byte.
pub const MBOX_HOST_REQUEST: u32 = 0x4000_0010;
/// MCU-to-host response byte for the host channel.
pub const MBOX_HOST_RESPONSE: u32 = 0x4000_0014;
/// Device-initiated message byte.
pub const MBOX_DEVICE_OUT: u32 = 0x4000_0018;
/// Host acknowledge for device-initiated messages.
pub const MBOX_DEVICE_OUT_ACK: u32 = 0x4000_001c;
/// Interrupt status, write-1-to-clear.
pub const MBOX_INT_STATUS: u32 = 0x4000_0020;
/// Signal-processor doorbell request byte (DSP region).
pub const MBOX_DSP_REQUEST: u32 = 0x3800_0000;
/// Signal-processor response byte (DSP region).
pub const MBOX_DSP_RESPONSE: u32 = 0x3800_0004;

/// Interrupt-status bits.
pub const INT_HOST_RESPONSE: u8 = 1 << 0;
pub const INT_DEVICE_OUT: u8 = 1 << 1;
pub const INT_DSP_RESPONSE: u8 = 1 << 2;

pub const TOGGLE_BIT: u8 = 0x80;
pub const PAYLOAD_MASK: u8 = 0x7f;

/// Responses `0x40..=0x7f` carry six data bits in bits 0..5.
const DATA_LOW: u8 = 0x40;
const DATA_BITS: u8 = 0x3f;

/// Six bits per exchange; five exchanges move one 32-bit value
/// (30 significant bits, most-significant chunk last).
pub const WORD_EXCHANGES: usize = 5;

/// Consecutive error responses tolerated during the sync handshake.
const SYNC_ERROR_BUDGET: u32 = 3;

pub const DEFAULT_WAIT_ITERATIONS: u32 = 10_000;
pub const DEFAULT_WAIT_INTERVAL_US: u32 = 100;

/// Exchange-area status meaning "host wrote the op, device has not
/// answered yet".
pub const EXT_STATUS_PENDING: u32 = 0xffff_ffff;

/// Primitive request opcodes (low 7 bits of the request byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0x00,
    Cont = 0x01,
    Prepare = 0x02,
    Extended = 0x03,
    Data = 0x04,
    /// Request the control-MCU firmware state block address.
    StateAddr = 0x08,
}

/// Operation codes carried in the exchange area by [`Opcode::Extended`].
///
/// Ops that move more than the two payload words stage their blob at
/// the open-RAM window first; the payload then carries a record-specific
/// meta word and the staged length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum ExtOp {
    /// Reports firmware run state in payload word 0.
    BootStatus = 0x10,
    /// Apply a staged fixed-shape configuration record. Meta word is
    /// the package tag the blob was decoded from.
    ApplyConfig = 0x11,
    PosteriorBegin = 0x12,
    /// Meta word is the state index.
    PosteriorState = 0x13,
    /// Meta word is `state << 16 | class`.
    PosteriorClass = 0x14,
    PosteriorEnable = 0x15,
    PosteriorReset = 0x16,
    FrontEndBegin = 0x17,
    /// Meta word is the first boundary index of the staged slice.
    FrontEndBoundaries = 0x18,
    /// Meta word is the rule index.
    FlowRule = 0x19,
    FlowApply = 0x1a,
    ClockPreset = 0x20,
    HeartbeatInterval = 0x21,
    InputSource = 0x22,
    /// Meta word is the sensor slot; the record itself is read out of
    /// the scratch region by firmware.
    SensorApply = 0x23,
    /// Hand one staged window to the secured bootloader.
    SecureWindow = 0x30,
    SecureDone = 0x31,
    /// Ask secured firmware to publish identity and versions into the
    /// scratch region.
    SecureInfo = 0x32,
}

/// Decoded response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Success,
    Cont,
    DeviceError,
    /// Six payload bits from a `0x40..=0x7f` response.
    Data(u8),
}

impl Response {
    fn decode(payload: u8) -> Option<Response> {
        match payload {
            0x00 => Some(Response::Success),
            0x01 => Some(Response::Cont),
            0x02 => Some(Response::DeviceError),
            DATA_LOW..=PAYLOAD_MASK => Some(Response::Data(payload & DATA_BITS)),
            _ => None,
        }
    }
}

bitfield! {
    /// Request byte layout.
    /// Bit 7: sequence toggle
    /// Bits 6:0: opcode or data chunk
    #[derive(Copy, Clone)]
    pub struct ControlByte(u8);
    impl Debug;
    pub u8, toggle, set_toggle: 7, 7;
    pub u8, payload, set_payload: 6, 0;
}

/// Extended-op exchange area, 16 bytes at the chip variant's exchange
/// origin. The host writes `op` and `payload` with `status` pending; the
/// device overwrites `status` and may overwrite `payload` with results.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ExchangeArea {
    pub op: u32,
    pub status: u32,
    pub payload: [u32; 2],
}

pub const EXCHANGE_LEN: usize = core::mem::size_of::<ExchangeArea>();

/// Per-channel traffic counters, owned by the session.
#[derive(Debug, Default, Clone, Copy)]
pub struct MailboxDiagnostics {
    pub requests: u32,
    pub responses: u32,
    pub unexpected: u32,
    pub sequence_errors: u32,
    pub timeouts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Idle,
    /// Awaiting the sync handshake acknowledge.
    Sync,
    /// Accumulating a multi-word value.
    Data,
}

/// One half-duplex mailbox channel.
pub struct MailboxChannel {
    name: &'static str,
    region: MemoryRegion,
    request_reg: u32,
    response_reg: u32,
    ready_bit: u8,
    /// Exchange area for extended ops; `None` on the doorbell channel.
    exchange_origin: Option<u32>,
    state: ChannelState,
    resync: bool,
    /// Sequence bit used on the previous request.
    request_toggle: u8,
    /// Sequence bit of the previous accepted response.
    response_toggle: u8,
    wait_iterations: u32,
    wait_interval_us: u32,
    diagnostics: MailboxDiagnostics,
}

impl MailboxChannel {
    /// Channel to the control MCU.
    pub fn host(exchange_origin: u32) -> Self {
        Self::new(
            "mcu",
            MemoryRegion::Mcu,
            MBOX_HOST_REQUEST,
            MBOX_HOST_RESPONSE,
            INT_HOST_RESPONSE,
            Some(exchange_origin),
        )
    }

    /// Doorbell channel to the signal processor.
    pub fn dsp() -> Self {
        Self::new(
            "dsp",
            MemoryRegion::Dsp,
            MBOX_DSP_REQUEST,
            MBOX_DSP_RESPONSE,
            INT_DSP_RESPONSE,
            None,
        )
    }

    fn new(
        name: &'static str,
        region: MemoryRegion,
        request_reg: u32,
        response_reg: u32,
        ready_bit: u8,
        exchange_origin: Option<u32>,
    ) -> Self {
        MailboxChannel {
            name,
            region,
            request_reg,
            response_reg,
            ready_bit,
            exchange_origin,
            state: ChannelState::Idle,
            resync: true,
            request_toggle: 0,
            response_toggle: 0,
            wait_iterations: DEFAULT_WAIT_ITERATIONS,
            wait_interval_us: DEFAULT_WAIT_INTERVAL_US,
            diagnostics: MailboxDiagnostics::default(),
        }
    }

    /// Forget sequencing state after a device reset; the next response is
    /// accepted regardless of its toggle bit.
    pub fn begin_resync(&mut self) {
        self.state = ChannelState::Idle;
        self.resync = true;
        self.request_toggle = 0;
        self.response_toggle = 0;
    }

    pub fn set_wait_budget(&mut self, iterations: u32, interval_us: u32) {
        self.wait_iterations = iterations;
        self.wait_interval_us = interval_us;
    }

    pub fn diagnostics(&self) -> &MailboxDiagnostics {
        &self.diagnostics
    }

    /// Sync handshake: resync, then `NOP` until the firmware acknowledges.
    /// Three consecutive error responses end the attempt.
    pub fn handshake(&mut self, bus: &mut dyn BusTransport) -> Result<()> {
        self.begin_resync();
        self.state = ChannelState::Sync;
        let mut errors = 0;
        loop {
            match self.transact(bus, Opcode::Nop) {
                Ok(Response::Success) => {
                    self.state = ChannelState::Idle;
                    log::debug!("{} mailbox in sync", self.name);
                    return Ok(());
                }
                Ok(Response::DeviceError) => {
                    errors += 1;
                    if errors == SYNC_ERROR_BUDGET {
                        self.state = ChannelState::Idle;
                        log::warn!("{} mailbox handshake failed", self.name);
                        return Err(Error::ProtocolSequence);
                    }
                }
                Ok(_) => {
                    self.state = ChannelState::Idle;
                    self.diagnostics.unexpected += 1;
                    return Err(Error::ProtocolSequence);
                }
                Err(err) => {
                    self.state = ChannelState::Idle;
                    return Err(err);
                }
            }
        }
    }

    /// One primitive exchange.
    pub fn transact(&mut self, bus: &mut dyn BusTransport, op: Opcode) -> Result<Response> {
        self.send(bus, op.into())?;
        let payload = self.await_response(bus)?;
        match Response::decode(payload) {
            Some(resp) => Ok(resp),
            None => {
                self.diagnostics.unexpected += 1;
                Err(Error::ProtocolSequence)
            }
        }
    }

    /// Primitive exchange that must come back `SUCCESS`.
    pub fn command(&mut self, bus: &mut dyn BusTransport, op: Opcode) -> Result<()> {
        match self.transact(bus, op)? {
            Response::Success => Ok(()),
            Response::DeviceError => Err(self.device_error(bus)),
            _ => {
                self.diagnostics.unexpected += 1;
                Err(Error::ProtocolSequence)
            }
        }
    }

    /// Query the control-MCU firmware state block address: `STATEADDR`,
    /// then five `CONT` pulls folding six bits each, least-significant
    /// chunk first.
    pub fn read_address(&mut self, bus: &mut dyn BusTransport) -> Result<u32> {
        match self.transact(bus, Opcode::StateAddr)? {
            Response::Cont => {}
            Response::DeviceError => return Err(self.device_error(bus)),
            _ => {
                self.diagnostics.unexpected += 1;
                return Err(Error::ProtocolSequence);
            }
        }
        self.state = ChannelState::Data;
        let mut address = 0u32;
        for chunk in 0..WORD_EXCHANGES {
            let bits = match self.transact(bus, Opcode::Cont) {
                Ok(Response::Data(bits)) => bits,
                Ok(Response::DeviceError) => {
                    self.state = ChannelState::Idle;
                    return Err(self.device_error(bus));
                }
                Ok(_) => {
                    self.state = ChannelState::Idle;
                    self.diagnostics.unexpected += 1;
                    return Err(Error::ProtocolSequence);
                }
                Err(err) => {
                    self.state = ChannelState::Idle;
                    return Err(err);
                }
            };
            address |= u32::from(bits) << (6 * chunk);
        }
        self.state = ChannelState::Idle;
        log::debug!("{} state block at 0x{:08x}", self.name, address);
        Ok(address)
    }

    /// Push one 32-bit word through the byte channel: `DATA`, then five
    /// six-bit chunk requests. The device answers `CONT` to each chunk
    /// except the last, which completes with `SUCCESS`.
    pub fn send_word(&mut self, bus: &mut dyn BusTransport, word: u32) -> Result<()> {
        match self.transact(bus, Opcode::Data)? {
            Response::Cont => {}
            Response::DeviceError => return Err(self.device_error(bus)),
            _ => {
                self.diagnostics.unexpected += 1;
                return Err(Error::ProtocolSequence);
            }
        }
        self.state = ChannelState::Data;
        for chunk in 0..WORD_EXCHANGES {
            let bits = ((word >> (6 * chunk)) & u32::from(DATA_BITS)) as u8;
            let result = self.chunk_exchange(bus, bits, chunk == WORD_EXCHANGES - 1);
            if let Err(err) = result {
                self.state = ChannelState::Idle;
                return Err(err);
            }
        }
        self.state = ChannelState::Idle;
        Ok(())
    }

    fn chunk_exchange(&mut self, bus: &mut dyn BusTransport, bits: u8, last: bool) -> Result<()> {
        self.send(bus, DATA_LOW | bits)?;
        let payload = self.await_response(bus)?;
        match Response::decode(payload) {
            Some(Response::Cont) if !last => Ok(()),
            Some(Response::Success) if last => Ok(()),
            Some(Response::DeviceError) => Err(self.device_error(bus)),
            _ => {
                self.diagnostics.unexpected += 1;
                Err(Error::ProtocolSequence)
            }
        }
    }

    /// Run one extended op through the exchange area. Returns the payload
    /// words the device left behind.
    pub fn extended(
        &mut self,
        bus: &mut dyn BusTransport,
        op: u32,
        payload: [u32; 2],
    ) -> Result<[u32; 2]> {
        let origin = match self.exchange_origin {
            Some(origin) => origin,
            None => return Err(Error::Unsupported),
        };
        let area = ExchangeArea {
            op,
            status: EXT_STATUS_PENDING,
            payload,
        };
        bus.write(MemoryRegion::Mcu, origin, area.as_bytes())?;
        match self.transact(bus, Opcode::Extended)? {
            Response::Success => {}
            Response::DeviceError => return Err(self.device_error(bus)),
            _ => {
                self.diagnostics.unexpected += 1;
                return Err(Error::ProtocolSequence);
            }
        }
        let mut raw = [0u8; EXCHANGE_LEN];
        bus.read(MemoryRegion::Mcu, origin, &mut raw)?;
        let area = match ExchangeArea::read_from_bytes(&raw) {
            Ok(area) => area,
            Err(_) => return Err(Error::ProtocolSequence),
        };
        if area.status != 0 {
            return Err(Error::DeviceReported(area.status));
        }
        Ok(area.payload)
    }

    fn send(&mut self, bus: &mut dyn BusTransport, payload: u8) -> Result<()> {
        // Flip first: the bit on the wire is the complement of the
        // previous request's bit.
        self.request_toggle ^= TOGGLE_BIT;
        let mut ctrl = ControlByte(payload & PAYLOAD_MASK);
        ctrl.set_toggle(self.request_toggle >> 7);
        bus.write(self.region, self.request_reg, &[ctrl.0])?;
        self.diagnostics.requests += 1;
        log::trace!("{} send 0x{:02x}", self.name, ctrl.0);
        Ok(())
    }

    fn await_response(&mut self, bus: &mut dyn BusTransport) -> Result<u8> {
        // Interrupt wait is a fast path only; the status poll below is
        // authoritative.
        let _ = bus.wait_for_mailbox_signal();
        for _ in 0..self.wait_iterations {
            let mut status = [0u8; 1];
            bus.read(MemoryRegion::Mcu, MBOX_INT_STATUS, &mut status)?;
            if status[0] & self.ready_bit != 0 {
                bus.write(MemoryRegion::Mcu, MBOX_INT_STATUS, &[self.ready_bit])?;
                let mut byte = [0u8; 1];
                bus.read(self.region, self.response_reg, &mut byte)?;
                return self.accept(byte[0]);
            }
            bus.sleep_microseconds(self.wait_interval_us);
        }
        self.diagnostics.timeouts += 1;
        log::warn!("{} mailbox wait timed out", self.name);
        Err(Error::Timeout)
    }

    /// Sequence-check a received byte. A mismatch leaves every channel
    /// field untouched.
    fn accept(&mut self, byte: u8) -> Result<u8> {
        let received = byte & TOGGLE_BIT;
        if self.resync {
            self.response_toggle = received;
            self.resync = false;
        } else if received != self.response_toggle ^ TOGGLE_BIT {
            self.diagnostics.sequence_errors += 1;
            log::warn!("{} sequence mismatch on 0x{:02x}", self.name, byte);
            return Err(Error::ProtocolSequence);
        } else {
            self.response_toggle = received;
        }
        self.diagnostics.responses += 1;
        log::trace!("{} resp 0x{:02x}", self.name, byte);
        Ok(byte & PAYLOAD_MASK)
    }

    fn device_error(&mut self, bus: &mut dyn BusTransport) -> Error {
        let code = match self.exchange_origin {
            // The device leaves its detailed code in the exchange status
            // word when it answers ERROR.
            Some(origin) => {
                read_word(bus, MemoryRegion::Mcu, origin + 4).unwrap_or(EXT_STATUS_PENDING)
            }
            None => 0x02,
        };
        Error::DeviceReported(code)
    }
}

/// Drain one device-initiated message, acknowledging it by echo. Returns
/// `None` when nothing is pending.
pub fn take_device_message(bus: &mut dyn BusTransport) -> Result<Option<u8>> {
    let mut status = [0u8; 1];
    bus.read(MemoryRegion::Mcu, MBOX_INT_STATUS, &mut status)?;
    if status[0] & INT_DEVICE_OUT == 0 {
        return Ok(None);
    }
    bus.write(MemoryRegion::Mcu, MBOX_INT_STATUS, &[INT_DEVICE_OUT])?;
    let mut byte = [0u8; 1];
    bus.read(MemoryRegion::Mcu, MBOX_DEVICE_OUT, &mut byte)?;
    bus.write(MemoryRegion::Mcu, MBOX_DEVICE_OUT_ACK, &byte)?;
    log::trace!("device message 0x{:02x}", byte[0]);
    Ok(Some(byte[0]))
}
