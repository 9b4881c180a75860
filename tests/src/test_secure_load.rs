// Licensed under the Apache-2.0 license

//! Loads against a security-locked part: raw streaming through the open
//! RAM window to the bootloader, plus the secure info handshake.

use aoncore_driver::chip::ChipType;
use aoncore_driver::load::{INTERFACE_MAJOR, INTERFACE_MINOR};
use aoncore_driver::mailbox::ExtOp;
use aoncore_driver::package::{InterfaceVersion, StringKind};
use aoncore_driver::{DeviceSession, Error, InitMode};

use crate::common::{init_logging, layout, patterned, scratch_image, MockBus, DEFAULT_DEVICE_ID};

fn secured_bus() -> MockBus {
    let bus = MockBus::new(DEFAULT_DEVICE_ID);
    bus.model().borrow_mut().sec_locked = true;
    bus
}

#[test]
fn test_secured_stream_reaches_the_bootloader_in_order() {
    init_logging();
    let mut bus = secured_bus();
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();

    let image = patterned(5000, 0x90);
    log::info!("streaming {} secured bytes in 1900-byte chunks...", image.len());
    for piece in image.chunks(1900) {
        session.load(piece).unwrap();
    }
    {
        // Caller chunks smaller than the window map one to one.
        let model = model.borrow();
        let windows: Vec<[u32; 2]> = model
            .ops(ExtOp::SecureWindow)
            .iter()
            .map(|event| event.request)
            .collect();
        assert_eq!(windows, vec![[0, 1900], [1900, 1900], [3800, 1200]]);
    }

    session.load(&[]).unwrap();

    let model = model.borrow();
    assert_eq!(model.secure_stream, image);
    let done = model.ops(ExtOp::SecureDone);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].request, [5000, 0]);
    // No record ever reached the parser side.
    assert!(model.ops(ExtOp::ApplyConfig).is_empty());

    // The bootloader booted both cores and discovery ran again.
    assert!(session.secured());
    assert_eq!(session.addresses().mcu_state, Some(layout::MCU_STATE_ADDR));
    assert_eq!(session.addresses().dsp_state, Some(layout::DSP_STATE_ADDR));
    assert_eq!(session.diagnostics().stats.loads_completed, 1);
}

#[test]
fn test_oversized_chunk_is_split_at_the_window() {
    init_logging();
    let mut bus = secured_bus();
    let model = bus.model();
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();

    // One caller chunk larger than the 2 KiB open RAM window.
    session.load(&patterned(5000, 0x21)).unwrap();

    let model = model.borrow();
    let windows: Vec<[u32; 2]> = model
        .ops(ExtOp::SecureWindow)
        .iter()
        .map(|event| event.request)
        .collect();
    assert_eq!(windows, vec![[0, 2048], [2048, 2048], [4096, 904]]);
}

#[test]
fn test_secure_info_populates_the_cache() {
    init_logging();
    let mut bus = secured_bus();
    let model = bus.model();
    model.borrow_mut().secure_info_image = Some(scratch_image(|scratch| {
        scratch.set_identity(&InterfaceVersion {
            chip_type: u32::from(u8::from(ChipType::Aon210)),
            major: INTERFACE_MAJOR,
            minor: INTERFACE_MINOR,
            patch: 0,
        });
        scratch
            .set_version(StringKind::Firmware, b"secure fw 9")
            .unwrap();
    }));
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();

    // The first chunk flips the session into secured streaming.
    session.load(&patterned(100, 0x01)).unwrap();
    assert!(session.secured());

    session.secure_get_info().unwrap();
    assert_eq!(model.borrow().ops(ExtOp::SecureInfo).len(), 1);
    assert_eq!(session.version(StringKind::Firmware), Some("secure fw 9"));
    let identity = session.identity().expect("identity published by firmware");
    assert_eq!(identity.major, INTERFACE_MAJOR);
}

#[test]
fn test_secure_info_without_published_image_is_a_checksum_miss() {
    init_logging();
    let mut bus = secured_bus();
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();

    session.load(&patterned(64, 0x02)).unwrap();
    assert_eq!(session.secure_get_info(), Err(Error::ChecksumMismatch));
    assert!(session.identity().is_none());
}

#[test]
fn test_boot_failure_after_secure_done_is_reported() {
    init_logging();
    let mut bus = secured_bus();
    bus.model().borrow_mut().ext_fail = Some((u32::from(ExtOp::BootStatus), 0x77));
    let mut session = DeviceSession::init(&mut bus, InitMode::Reset).unwrap();

    session.load(&patterned(600, 0x05)).unwrap();
    let err = session.load(&[]).unwrap_err();
    assert_eq!(err, Error::DeviceReported(0x77));
    assert_eq!(session.diagnostics().stats.loads_completed, 0);
    assert_eq!(session.last_error(), Some(Error::DeviceReported(0x77)));
}
