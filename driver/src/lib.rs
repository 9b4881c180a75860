// Licensed under the Apache-2.0 license

//! Host-side driver for the always-on inference coprocessor family.
//!
//! The driver is split along the seams of the device itself: a word
//! [`mailbox`] carries commands and discovery, [`package`] parses the
//! TLV firmware/model packages incrementally, [`load`] routes decoded
//! records into device memory, [`extract`] drains the circular capture
//! tanks, [`scratch`] caches identity and configuration in a preserved
//! RAM window, and [`session`] ties the pieces to one attached device.
//!
//! Everything below [`session`] is deliberately free of allocation so
//! the crate can run `no_std` on a host MCU; the `std` feature only
//! adds `std::error::Error` impls and test scaffolding.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod chip;
pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod mailbox;
pub mod notify;
pub mod package;
pub mod scratch;
pub mod serial;
pub mod session;

pub use chip::{probe, ChipType, ChipVariant};
pub use error::{Error, Result};
pub use extract::{ExtractPolicy, Extractor, RingDescriptor, StreamKind};
pub use mailbox::{ExtOp, MailboxChannel, Opcode};
pub use notify::Notifications;
pub use package::{PackageEvent, PackageParser, PackageSink};
pub use scratch::ScratchRegion;
pub use session::{DeviceSession, InitMode, MatchStrengthKind};
