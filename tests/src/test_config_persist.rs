// Licensed under the Apache-2.0 license

//! Runtime configuration ops and their persistence across sessions.

use aoncore_bus::MemoryRegion;
use aoncore_driver::config::{preset_named, InputSource, CLOCK_PRESETS};
use aoncore_driver::mailbox::ExtOp;
use aoncore_driver::package::SensorRecord;
use aoncore_driver::scratch::SCRATCH_LEN;
use aoncore_driver::{DeviceSession, Error, InitMode};

use crate::common::{init_logging, DeviceModel, MockBus, DEFAULT_DEVICE_ID};

fn scratch_flushes(model: &DeviceModel) -> usize {
    let origin = model.scratch_origin();
    model
        .ram_writes
        .iter()
        .filter(|(region, address, len)| {
            *region == MemoryRegion::Mcu && *address == origin && *len == SCRATCH_LEN as u32
        })
        .count()
}

#[test]
fn test_clock_preset_applies_and_survives_reattach() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    let index = preset_named("mode_1p0v_32768_49p152MHz").unwrap();
    session.apply_clock_preset(index).unwrap();
    assert_eq!(session.clock_preset(), Some(index as u32));
    {
        let model = model.borrow();
        let ops = model.ops(ExtOp::ClockPreset);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].request, [index as u32, CLOCK_PRESETS[index].core_hz]);

        // The persisted image on the device carries a valid seal.
        let raw = model.bytes(MemoryRegion::Mcu, model.scratch_origin(), SCRATCH_LEN);
        let stored = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        assert_eq!(stored, crc32fast::hash(&raw[4..]));
    }
    session.uninit();

    // A later session recovers the choice from scratch alone.
    let session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();
    assert_eq!(session.clock_preset(), Some(index as u32));
    assert_eq!(model.borrow().ops(ExtOp::ClockPreset).len(), 1);
}

#[test]
fn test_out_of_range_preset_is_refused_without_traffic() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    assert_eq!(
        session.apply_clock_preset(CLOCK_PRESETS.len()),
        Err(Error::Unsupported)
    );
    assert!(model.borrow().ops(ExtOp::ClockPreset).is_empty());
    assert_eq!(session.clock_preset(), None);
}

#[test]
fn test_heartbeat_interval_persists() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    session.set_heartbeat_interval(250).unwrap();
    assert_eq!(session.heartbeat_interval_ms(), Some(250));
    let ops = model.borrow().ops(ExtOp::HeartbeatInterval);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].request, [250, 0]);
    session.uninit();

    let session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();
    assert_eq!(session.heartbeat_interval_ms(), Some(250));
}

#[test]
fn test_input_source_is_runtime_only() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    let flushes_before = scratch_flushes(&model.borrow());
    session.set_input_source(InputSource::I2s).unwrap();

    let model = model.borrow();
    let ops = model.ops(ExtOp::InputSource);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].request, [1, 0]);
    // No scratch flush: the source is not a persisted setting.
    assert_eq!(scratch_flushes(&model), flushes_before);
}

#[test]
fn test_posterior_enable_always_restarts_the_handler() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    session.set_posterior_enable(true, true).unwrap();
    session.set_posterior_enable(false, false).unwrap();

    let model = model.borrow();
    let enables = model.ops(ExtOp::PosteriorEnable);
    assert_eq!(enables.len(), 2);
    assert_eq!(enables[0].request, [1, 1]);
    assert_eq!(enables[1].request, [0, 0]);
    assert_eq!(model.ops(ExtOp::PosteriorReset).len(), 2);

    // Each enable is chased by its reset, even on disable.
    for (at, event) in model.ext_log.iter().enumerate() {
        if event.is(ExtOp::PosteriorEnable) {
            assert!(model.ext_log[at + 1].is(ExtOp::PosteriorReset));
        }
    }
}

#[test]
fn test_sensor_apply_persists_and_respects_slots() {
    init_logging();
    let mut bus = MockBus::running(DEFAULT_DEVICE_ID);
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();

    let record = SensorRecord {
        id: 2,
        interface: 2,
        interface_address: 0,
        unused: [0; 2],
        gpio_roles: [3, 4, 5, 0, 0, 0, 0, 0],
        axis_enable: 0x3,
        axis_invert: 0x2,
        parameters: [0x11; 16],
    };
    session.apply_sensor(1, &record).unwrap();
    assert_eq!(session.sensor(1), Some(record));
    {
        let model = model.borrow();
        let ops = model.ops(ExtOp::SensorApply);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].request, [1, 0]);
    }

    // This variant carries two sensor slots; slot two is out of range
    // and must not reach the device.
    assert_eq!(session.apply_sensor(2, &record), Err(Error::Unsupported));
    assert_eq!(model.borrow().ops(ExtOp::SensorApply).len(), 1);
    session.uninit();

    let session = DeviceSession::init(&mut bus, InitMode::Attach).unwrap();
    assert_eq!(session.sensor(1), Some(record));
}

#[test]
fn test_config_on_silent_firmware_times_out() {
    init_logging();
    let mut bus = MockBus::new(DEFAULT_DEVICE_ID);
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();
    session.set_wait_budget(25, 0);

    assert_eq!(session.apply_clock_preset(5), Err(Error::Timeout));
    assert_eq!(session.clock_preset(), None, "nothing persisted on failure");
    assert_eq!(session.last_error(), Some(Error::Timeout));
    assert_eq!(session.diagnostics().stats.failures, 1);
    assert_eq!(session.diagnostics().host.timeouts, 1);
}
