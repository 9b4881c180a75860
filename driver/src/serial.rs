// Licensed under the Apache-2.0 license

//! Peripheral bridge over the signal-processor serial engine.
//!
//! The signal processor owns the sensor-facing I2C and SPI masters. The
//! host drives them through a 20-byte window inside the DSP firmware
//! state block: a control word followed by a 16-byte data area. One
//! transfer is split into windows, all write chunks first, then all read
//! chunks; each window is handed over by writing it, kicking the DSP
//! doorbell, and reading the control word back once the engine clears
//! the run bit.

use aoncore_bus::{BusTransport, MemoryRegion};
use bitfield::bitfield;

use crate::error::{Error, Result};
use crate::mailbox::{MailboxChannel, Opcode};

/// Data bytes carried per window.
pub const SERIAL_DATA_LEN: usize = 16;
/// Control word plus data area.
pub const SERIAL_WINDOW_LEN: usize = 4 + SERIAL_DATA_LEN;

/// Bit 7 of the address byte marks an I2C target; SPI targets keep it
/// clear and carry the select pin and mode instead.
const I2C_ADDRESS_FLAG: u8 = 0x80;
const SPI_MODE_SHIFT: u8 = 5;
const SPI_MODE_MAX: u8 = 3;

const STATUS_TIMEOUT: u32 = 1;

bitfield! {
    /// Control word at the head of the serial window.
    /// Bits 7:0: encoded target address byte
    /// Bit 8: hold the peripheral transaction open after this window
    /// Bits 13:9 / 18:14: write / read byte count for this window
    /// Bit 19: run, set by host, cleared by the engine
    /// Bits 21:20: completion status
    #[derive(Copy, Clone)]
    pub struct SerialControl(u32);
    impl Debug;
    pub address, set_address: 7, 0;
    pub cont, set_cont: 8;
    pub out_len, set_out_len: 13, 9;
    pub in_len, set_in_len: 18, 14;
    pub run, set_run: 19;
    pub status, set_status: 21, 20;
}

/// Peripheral behind the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialTarget {
    /// Seven-bit address on the sensor I2C bus.
    I2c { address: u8 },
    /// SPI peripheral behind a chip-select GPIO; `mode` is the usual
    /// polarity/phase number.
    Spi { select: u8, mode: u8 },
}

/// Fold a target into the address byte the engine understands.
pub fn encode_target(target: SerialTarget, gpio_count: u32) -> Result<u8> {
    match target {
        SerialTarget::I2c { address } => {
            if address > 0x7f {
                return Err(Error::Unsupported);
            }
            Ok(address | I2C_ADDRESS_FLAG)
        }
        SerialTarget::Spi { select, mode } => {
            if u32::from(select) >= gpio_count || mode > SPI_MODE_MAX {
                return Err(Error::Unsupported);
            }
            Ok(select | (mode << SPI_MODE_SHIFT))
        }
    }
}

/// Run one peripheral transaction through the window at `window_addr`.
///
/// `out` is sent in full before any of `input` is filled. `hold` keeps
/// the peripheral transaction open past the final window so a follow-up
/// call can continue it (register-pointer writes followed by a repeated
/// start, typically).
pub fn transfer(
    bus: &mut dyn BusTransport,
    dsp: &mut MailboxChannel,
    window_addr: u32,
    target: u8,
    out: &[u8],
    input: &mut [u8],
    hold: bool,
) -> Result<()> {
    let mut sent = 0usize;
    let mut received = 0usize;
    while sent < out.len() || received < input.len() {
        let out_chunk = (out.len() - sent).min(SERIAL_DATA_LEN);
        let in_chunk = if out_chunk == 0 {
            (input.len() - received).min(SERIAL_DATA_LEN)
        } else {
            0
        };
        let more = sent + out_chunk < out.len() || received + in_chunk < input.len();

        let mut control = SerialControl(0);
        control.set_address(u32::from(target));
        control.set_cont(more || hold);
        control.set_out_len(out_chunk as u32);
        control.set_in_len(in_chunk as u32);
        control.set_run(true);

        let mut window = [0u8; SERIAL_WINDOW_LEN];
        window[..4].copy_from_slice(&control.0.to_le_bytes());
        window[4..4 + out_chunk].copy_from_slice(&out[sent..sent + out_chunk]);
        // Only the words in use travel over the bus.
        bus.write(MemoryRegion::Dsp, window_addr, &window[..4 + round_word(out_chunk)])?;

        dsp.command(bus, Opcode::Nop)?;

        let mut readback = [0u8; SERIAL_WINDOW_LEN];
        bus.read(
            MemoryRegion::Dsp,
            window_addr,
            &mut readback[..4 + round_word(in_chunk)],
        )?;
        let control = SerialControl(u32::from_le_bytes([
            readback[0],
            readback[1],
            readback[2],
            readback[3],
        ]));
        if control.run() {
            // The engine acknowledged the doorbell without picking the
            // window up.
            log::warn!("serial window ignored, run bit still set");
            return Err(Error::Timeout);
        }
        match control.status() {
            0 => {}
            STATUS_TIMEOUT => return Err(Error::Timeout),
            other => return Err(Error::DeviceReported(other)),
        }
        input[received..received + in_chunk].copy_from_slice(&readback[4..4 + in_chunk]);
        sent += out_chunk;
        received += in_chunk;
    }
    Ok(())
}

fn round_word(len: usize) -> usize {
    (len + 3) & !3
}
