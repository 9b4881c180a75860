// Licensed under the Apache-2.0 license

//! Runtime configuration surface
//!
//! Every setter follows the same pattern: push the setting to firmware
//! over an extended op, then record it in the scratch region so a later
//! attach can read the device's configuration back without disturbing
//! firmware. Getters come from the scratch shadow and never touch the
//! bus.

use aoncore_bus::BusTransport;
use num_enum::IntoPrimitive;

use crate::error::{Error, Result};
use crate::mailbox::{ExtOp, MailboxChannel};
use crate::package::SensorRecord;
use crate::scratch::ScratchRegion;

/// One PLL operating point. The label encodes core voltage, reference
/// input, and resulting core clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockPreset {
    pub name: &'static str,
    /// Core voltage in millivolts.
    pub voltage_mv: u32,
    /// External reference frequency the preset expects.
    pub input_hz: u32,
    /// Resulting core clock.
    pub core_hz: u32,
}

/// Operating points mirroring the firmware PLL table. Index positions
/// are part of the device interface; new presets go at the end.
pub const CLOCK_PRESETS: &[ClockPreset] = &[
    ClockPreset {
        name: "mode_0p9v_32768_10p752MHz",
        voltage_mv: 900,
        input_hz: 32_768,
        core_hz: 10_752_000,
    },
    ClockPreset {
        name: "mode_0p9v_32768_15p360MHz",
        voltage_mv: 900,
        input_hz: 32_768,
        core_hz: 15_360_000,
    },
    ClockPreset {
        name: "mode_0p9v_32768_21p504MHz",
        voltage_mv: 900,
        input_hz: 32_768,
        core_hz: 21_504_000,
    },
    ClockPreset {
        name: "mode_0p9v_4p096MHz_10p752MHz",
        voltage_mv: 900,
        input_hz: 4_096_000,
        core_hz: 10_752_000,
    },
    ClockPreset {
        name: "mode_0p9v_4p096MHz_21p504MHz",
        voltage_mv: 900,
        input_hz: 4_096_000,
        core_hz: 21_504_000,
    },
    ClockPreset {
        name: "mode_1p0v_32768_49p152MHz",
        voltage_mv: 1000,
        input_hz: 32_768,
        core_hz: 49_152_000,
    },
    ClockPreset {
        name: "mode_1p0v_32768_55p296MHz",
        voltage_mv: 1000,
        input_hz: 32_768,
        core_hz: 55_296_000,
    },
    ClockPreset {
        name: "mode_1p0v_4p096MHz_49p152MHz",
        voltage_mv: 1000,
        input_hz: 4_096_000,
        core_hz: 49_152_000,
    },
    ClockPreset {
        name: "mode_1p1v_32768_76p800MHz",
        voltage_mv: 1100,
        input_hz: 32_768,
        core_hz: 76_800_000,
    },
    ClockPreset {
        name: "mode_1p1v_4p096MHz_98p304MHz",
        voltage_mv: 1100,
        input_hz: 4_096_000,
        core_hz: 98_304_000,
    },
];

/// Look a preset up by label.
pub fn preset_named(name: &str) -> Option<usize> {
    CLOCK_PRESETS.iter().position(|preset| preset.name == name)
}

/// Audio source feeding the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u32)]
pub enum InputSource {
    Pdm = 0,
    I2s = 1,
    /// Host-pushed PCM over the serial bridge.
    Spi = 2,
}

/// Switch the PLL to `CLOCK_PRESETS[index]` and persist the choice.
pub fn apply_clock_preset(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    scratch: &mut ScratchRegion,
    index: usize,
) -> Result<()> {
    let preset = CLOCK_PRESETS.get(index).ok_or(Error::Unsupported)?;
    host.extended(bus, ExtOp::ClockPreset.into(), [index as u32, preset.core_hz])?;
    scratch.set_clock_preset(index as u32);
    scratch.flush(bus)?;
    log::info!("clock preset {} applied", preset.name);
    Ok(())
}

/// Set the firmware liveness beat period. Zero disables the beat.
pub fn set_heartbeat_interval(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    scratch: &mut ScratchRegion,
    interval_ms: u32,
) -> Result<()> {
    host.extended(bus, ExtOp::HeartbeatInterval.into(), [interval_ms, 0])?;
    scratch.set_heartbeat_interval_ms(interval_ms);
    scratch.flush(bus)
}

pub fn set_input_source(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    source: InputSource,
) -> Result<()> {
    host.extended(bus, ExtOp::InputSource.into(), [source.into(), 0])?;
    Ok(())
}

/// Enable or disable the posterior handler, with `match_per_frame`
/// selecting whether every frame publishes a summary or only threshold
/// crossings do.
pub fn set_posterior_enable(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    enable: bool,
    match_per_frame: bool,
) -> Result<()> {
    host.extended(
        bus,
        ExtOp::PosteriorEnable.into(),
        [u32::from(enable), u32::from(match_per_frame)],
    )?;
    // The handler state machine restarts on every enable write, wanted
    // or not; match counters begin again from zero afterwards.
    host.extended(bus, ExtOp::PosteriorReset.into(), [0, 0])?;
    Ok(())
}

/// Store a sensor record and tell firmware to pick it up. The record is
/// flushed to the scratch region first; firmware reads it from there.
pub fn apply_sensor(
    bus: &mut dyn BusTransport,
    host: &mut MailboxChannel,
    scratch: &mut ScratchRegion,
    slot: usize,
    slots_available: usize,
    record: &SensorRecord,
) -> Result<()> {
    if slot >= slots_available {
        return Err(Error::Unsupported);
    }
    scratch.set_sensor(slot, record)?;
    scratch.flush(bus)?;
    host.extended(bus, ExtOp::SensorApply.into(), [slot as u32, 0])?;
    Ok(())
}
